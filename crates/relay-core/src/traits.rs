//! Core traits for session and report storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::{Coded, ErrorCode},
    sweep::{SweepPolicy, SweepReport},
    types::{
        Report, ReportId, ReportMeta, RequestId, SequenceGap, Session, SessionDelta, SessionId,
        SessionStatus, SessionSummary,
    },
};

/// Session filter for listings.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Filter by status.
    pub status: Option<SessionStatus>,
    /// Limit results.
    pub limit: Option<usize>,
}

impl SessionFilter {
    #[must_use]
    pub fn matches(&self, summary: &SessionSummary) -> bool {
        self.status.is_none_or(|status| summary.status == status)
    }
}

/// Aggregate storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_sessions: usize,
    pub active: usize,
    pub idle: usize,
    pub expired: usize,
    pub pending_events: usize,
    pub total_bytes: u64,
    pub largest_session_bytes: u64,
    pub oldest_activity: Option<i64>,
    pub newest_activity: Option<i64>,
}

impl StorageStats {
    /// Fold one session into the totals.
    pub fn record(&mut self, summary: &SessionSummary, bytes: u64) {
        self.total_sessions += 1;
        match summary.status {
            SessionStatus::Active => self.active += 1,
            SessionStatus::Idle => self.idle += 1,
            SessionStatus::Expired => self.expired += 1,
            SessionStatus::Closed => {}
        }
        self.pending_events += summary.pending;
        self.total_bytes += bytes;
        self.largest_session_bytes = self.largest_session_bytes.max(bytes);
        self.oldest_activity = Some(
            self.oldest_activity
                .map_or(summary.last_activity, |t| t.min(summary.last_activity)),
        );
        self.newest_activity = Some(
            self.newest_activity
                .map_or(summary.last_activity, |t| t.max(summary.last_activity)),
        );
    }
}

/// Session storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session expired: {0}")]
    Expired(SessionId),
    #[error("Session {id}: {source}")]
    Sequence {
        id: SessionId,
        #[source]
        source: SequenceGap,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt session record: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl Coded for StorageError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Expired(_) => ErrorCode::Expired,
            _ => ErrorCode::StorageFailure,
        }
    }
}

/// Trait for session storage backends.
///
/// Callers serialize mutations of one session; implementations only need to
/// be safe across different sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Allocate and durably record a new active session.
    async fn create(&self) -> Result<Session, StorageError>;

    /// Load a session that is neither expired nor closed.
    async fn load(&self, id: SessionId) -> Result<Session, StorageError>;

    /// Refresh the last-activity timestamp.
    async fn touch(&self, id: SessionId) -> Result<(), StorageError>;

    /// Durably commit a delta and return the resulting state.
    ///
    /// The write has completed when this returns `Ok`.
    async fn persist(&self, id: SessionId, delta: SessionDelta) -> Result<Session, StorageError>;

    /// Expire inactive sessions and reclaim storage past the grace period.
    async fn sweep(&self, now: i64) -> Result<SweepReport, StorageError>;

    /// Destroy a session and its storage.
    async fn remove(&self, id: SessionId) -> Result<(), StorageError>;

    /// List sessions, newest activity first.
    async fn list(&self, filter: SessionFilter) -> Result<Vec<SessionSummary>, StorageError>;

    /// Aggregate statistics.
    async fn stats(&self) -> Result<StorageStats, StorageError>;

    /// Expiry policy this store sweeps with.
    fn policy(&self) -> &SweepPolicy;
}

/// Report sink error.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report not found: {0}")]
    NotFound(ReportId),
    #[error("Report {0} already exists with different content")]
    Conflict(ReportId),
    #[error("Corrupt report {id}: {reason}")]
    Corrupt { id: ReportId, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Report storage error: {0}")]
    Internal(String),
}

impl Coded for ReportError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::ReportConflict,
            _ => ErrorCode::StorageFailure,
        }
    }
}

/// Append-only artifact store.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Write a report once and return its identifier.
    ///
    /// Repeating a write with identical content is a no-op; differing content
    /// under the same identifier fails with `Conflict`.
    async fn write(
        &self,
        session_id: SessionId,
        request_id: &RequestId,
        payload: &[u8],
    ) -> Result<ReportId, ReportError>;

    /// Read a report by identifier.
    async fn read(&self, id: &ReportId) -> Result<Report, ReportError>;

    /// Reports produced by one session, oldest first.
    async fn list(&self, session_id: SessionId) -> Result<Vec<ReportMeta>, ReportError>;
}
