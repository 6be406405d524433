//! Expiry and retention planning shared by all session stores.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{SessionId, SessionStatus, SessionSummary};

/// Inactivity and retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    /// Inactivity period after which a session expires.
    pub inactivity_timeout: Duration,
    /// Additional period an expired session is kept before reclaiming it.
    pub grace: Duration,
    /// Upper bound on idle plus active sessions kept on disk.
    pub max_sessions: Option<usize>,
    /// Sessions larger than this are reclaimed unless a client is attached.
    pub max_session_bytes: Option<u64>,
}

/// Default size limit for one session's storage.
pub const DEFAULT_MAX_SESSION_BYTES: u64 = 100 * 1024 * 1024;

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(8 * 3600),
            grace: Duration::from_secs(3600),
            max_sessions: None,
            max_session_bytes: Some(DEFAULT_MAX_SESSION_BYTES),
        }
    }
}

impl SweepPolicy {
    /// True if a session last active at `last_activity` has timed out at `now`.
    #[must_use]
    pub fn is_inactive(&self, last_activity: i64, now: i64) -> bool {
        now.saturating_sub(last_activity) > millis(self.inactivity_timeout)
    }

    fn is_reclaimable(&self, last_activity: i64, now: i64) -> bool {
        now.saturating_sub(last_activity)
            > millis(self.inactivity_timeout).saturating_add(millis(self.grace))
    }

    fn is_oversized(&self, bytes: u64) -> bool {
        self.max_session_bytes.is_some_and(|max| bytes > max)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Sessions transitioned to expired during this pass.
    pub expired: Vec<SessionId>,
    /// Sessions whose storage was removed.
    pub reclaimed: Vec<SessionId>,
    pub freed_bytes: u64,
    pub errors: Vec<String>,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.reclaimed.is_empty() && self.errors.is_empty()
    }
}

/// Sessions a sweep pass should act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub expire: Vec<SessionId>,
    pub reclaim: Vec<SessionId>,
}

/// Decide which sessions to expire and which to reclaim.
///
/// `sessions` pairs each summary with the bytes it occupies. Live sessions
/// past the timeout expire; expired sessions past the grace period are
/// reclaimed, as are closed leftovers and sessions over `max_session_bytes`
/// that no client is attached to. When `max_sessions` is set, the least
/// recently active idle sessions beyond the cap are reclaimed too. Active
/// sessions are never reclaimed by the size limit or the cap.
#[must_use]
pub fn plan_sweep(sessions: &[(SessionSummary, u64)], now: i64, policy: &SweepPolicy) -> SweepPlan {
    let mut plan = SweepPlan::default();
    let mut survivors: Vec<&SessionSummary> = Vec::new();

    for (summary, bytes) in sessions {
        match summary.status {
            SessionStatus::Closed => plan.reclaim.push(summary.id),
            SessionStatus::Expired => {
                if policy.is_reclaimable(summary.last_activity, now) || policy.is_oversized(*bytes)
                {
                    plan.reclaim.push(summary.id);
                }
            }
            SessionStatus::Idle if policy.is_oversized(*bytes) => plan.reclaim.push(summary.id),
            SessionStatus::Active | SessionStatus::Idle => {
                if policy.is_reclaimable(summary.last_activity, now) {
                    plan.reclaim.push(summary.id);
                } else if policy.is_inactive(summary.last_activity, now) {
                    plan.expire.push(summary.id);
                } else {
                    survivors.push(summary);
                }
            }
        }
    }

    if let Some(max) = policy.max_sessions {
        if survivors.len() > max {
            let excess = survivors.len() - max;
            let mut idle: Vec<&SessionSummary> = survivors
                .into_iter()
                .filter(|s| s.status == SessionStatus::Idle)
                .collect();
            idle.sort_by_key(|s| s.last_activity);
            plan.reclaim.extend(idle.into_iter().take(excess).map(|s| s.id));
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    const HOUR: i64 = 3_600_000;

    fn summary(status: SessionStatus, last_activity: i64) -> (SessionSummary, u64) {
        sized(status, last_activity, 1024)
    }

    fn sized(status: SessionStatus, last_activity: i64, bytes: u64) -> (SessionSummary, u64) {
        let summary = SessionSummary {
            id: Uuid::new_v4(),
            status,
            created_at: 0,
            last_activity,
            head: 0,
            last_acked: 0,
            pending: 0,
            in_flight: 0,
        };
        (summary, bytes)
    }

    #[test]
    fn test_inactive_sessions_expire() {
        let policy = SweepPolicy::default();
        let now = 10 * HOUR;
        let fresh = summary(SessionStatus::Idle, now - HOUR);
        let stale = summary(SessionStatus::Active, now - 9 * HOUR);
        let plan = plan_sweep(&[fresh.clone(), stale.clone()], now, &policy);
        assert_eq!(plan.expire, vec![stale.0.id]);
        assert!(plan.reclaim.is_empty());
    }

    #[test]
    fn test_expired_sessions_reclaimed_after_grace() {
        let policy = SweepPolicy::default();
        let now = 20 * HOUR;
        let within_grace = summary(SessionStatus::Expired, now - 8 * HOUR - HOUR / 2);
        let past_grace = summary(SessionStatus::Expired, now - 10 * HOUR);
        let closed = summary(SessionStatus::Closed, now);
        let plan = plan_sweep(
            &[within_grace, past_grace.clone(), closed.clone()],
            now,
            &policy,
        );
        assert!(plan.expire.is_empty());
        assert_eq!(plan.reclaim, vec![past_grace.0.id, closed.0.id]);
    }

    #[test]
    fn test_retention_cap_reclaims_oldest_idle() {
        let policy = SweepPolicy {
            max_sessions: Some(2),
            ..SweepPolicy::default()
        };
        let now = 5 * HOUR;
        let oldest_active = summary(SessionStatus::Active, now - 4 * HOUR);
        let old_idle = summary(SessionStatus::Idle, now - 3 * HOUR);
        let new_idle = summary(SessionStatus::Idle, now - HOUR);
        let plan = plan_sweep(
            &[oldest_active, old_idle.clone(), new_idle],
            now,
            &policy,
        );
        assert_eq!(plan.reclaim, vec![old_idle.0.id]);
    }

    #[test]
    fn test_oversized_sessions_reclaimed_unless_active() {
        let policy = SweepPolicy {
            max_session_bytes: Some(10_000),
            ..SweepPolicy::default()
        };
        let now = 5 * HOUR;
        let big_active = sized(SessionStatus::Active, now - HOUR, 50_000);
        let big_idle = sized(SessionStatus::Idle, now - HOUR, 50_000);
        let big_expired = sized(SessionStatus::Expired, now - 8 * HOUR - HOUR / 2, 50_000);
        let small_idle = sized(SessionStatus::Idle, now - HOUR, 9_000);
        let plan = plan_sweep(
            &[big_active, big_idle.clone(), big_expired.clone(), small_idle],
            now,
            &policy,
        );
        assert!(plan.expire.is_empty());
        assert_eq!(plan.reclaim, vec![big_idle.0.id, big_expired.0.id]);

        let unlimited = SweepPolicy {
            max_session_bytes: None,
            ..policy
        };
        assert!(plan_sweep(&[big_idle], now, &unlimited).reclaim.is_empty());
    }
}
