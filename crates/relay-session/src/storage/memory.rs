//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use relay_core::{
    Session, SessionDelta, SessionFilter, SessionId, SessionStatus, SessionStore, SessionSummary,
    StorageError, StorageStats, SweepPolicy, SweepReport, now_millis, plan_sweep,
};
use tracing::debug;

use super::{applied, encoded_len, ensure_live};

/// In-memory storage implementation.
///
/// Useful for development and tests. "Durable" here means visible to every
/// later call in this process; data is lost on restart.
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    policy: SweepPolicy,
}

impl MemoryStore {
    #[must_use]
    pub fn new(policy: SweepPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            policy,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(SweepPolicy::default())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self) -> Result<Session, StorageError> {
        let session = Session::new(now_millis());

        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(session.id, session.clone());

        Ok(session)
    }

    async fn load(&self, id: SessionId) -> Result<Session, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get(&id).ok_or(StorageError::NotFound(id))?;
        ensure_live(session, &self.policy, now_millis())?;
        Ok(session.clone())
    }

    async fn touch(&self, id: SessionId) -> Result<(), StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        let now = now_millis();
        ensure_live(session, &self.policy, now)?;
        session.last_activity = session.last_activity.max(now);
        Ok(())
    }

    async fn persist(&self, id: SessionId, delta: SessionDelta) -> Result<Session, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        let now = now_millis();
        ensure_live(session, &self.policy, now)?;
        let next = applied(session, &delta, now)?;
        *session = next.clone();
        Ok(next)
    }

    async fn sweep(&self, now: i64) -> Result<SweepReport, StorageError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let summaries: Vec<(SessionSummary, u64)> = sessions
            .values()
            .map(|session| (session.summary(), encoded_len(session)))
            .collect();
        let plan = plan_sweep(&summaries, now, &self.policy);

        let mut report = SweepReport::default();
        for id in plan.expire {
            if let Some(session) = sessions.get_mut(&id) {
                session.status = SessionStatus::Expired;
                report.expired.push(id);
            }
        }
        for id in plan.reclaim {
            if let Some(session) = sessions.remove(&id) {
                report.freed_bytes += encoded_len(&session);
                report.reclaimed.push(id);
            }
        }

        if !report.is_empty() {
            debug!(
                expired = report.expired.len(),
                reclaimed = report.reclaimed.len(),
                "Memory sweep"
            );
        }
        Ok(report)
    }

    async fn remove(&self, id: SessionId) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(id))
    }

    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionSummary>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<SessionSummary> = sessions
            .values()
            .map(Session::summary)
            .filter(|s| filter.matches(s))
            .collect();

        // Newest activity first
        result.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut stats = StorageStats::default();
        for session in sessions.values() {
            stats.record(&session.summary(), encoded_len(session));
        }
        Ok(stats)
    }

    fn policy(&self) -> &SweepPolicy {
        &self.policy
    }
}
