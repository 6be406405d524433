//! Storage implementations.

pub mod file;
#[cfg(feature = "memory")]
pub mod memory;

pub use file::FileSessionStore;
#[cfg(feature = "memory")]
pub use memory::MemoryStore;

use relay_core::{Session, SessionStatus, StorageError, SweepPolicy};

/// Reject sessions that can no longer be used.
///
/// A session past its inactivity timeout counts as expired even before a
/// sweep has marked it.
pub(crate) fn ensure_live(
    session: &Session,
    policy: &SweepPolicy,
    now: i64,
) -> Result<(), StorageError> {
    match session.status {
        SessionStatus::Closed => Err(StorageError::NotFound(session.id)),
        SessionStatus::Expired => Err(StorageError::Expired(session.id)),
        SessionStatus::Active | SessionStatus::Idle
            if policy.is_inactive(session.last_activity, now) =>
        {
            Err(StorageError::Expired(session.id))
        }
        SessionStatus::Active | SessionStatus::Idle => Ok(()),
    }
}

/// Apply a delta to a copy so a rejected delta leaves `session` untouched.
pub(crate) fn applied(
    session: &Session,
    delta: &relay_core::SessionDelta,
    now: i64,
) -> Result<Session, StorageError> {
    let mut next = session.clone();
    next.apply(delta, now).map_err(|source| StorageError::Sequence {
        id: session.id,
        source,
    })?;
    Ok(next)
}

/// Serialized size of a session record.
pub(crate) fn encoded_len(session: &Session) -> u64 {
    serde_json::to_vec(session).map_or(0, |bytes| bytes.len() as u64)
}
