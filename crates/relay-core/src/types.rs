//! Session, request, event and report data model.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrorBody, ErrorCode};

/// Session identifier.
pub type SessionId = Uuid;

/// Current wall clock as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Client-chosen request identifier, unique within its session.
///
/// Accepts JSON strings and integers on input; always serializes as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

/// Report identifier (lowercase hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(String);

impl ReportId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the identifier is a 64 character lowercase hex string.
    ///
    /// Used to reject path components before touching the filesystem.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// At least one connection is attached.
    Active,
    /// No connection attached; pending events wait for a resume.
    Idle,
    /// Inactivity timeout elapsed; storage is reclaimed after the grace period.
    Expired,
    /// Closed explicitly by the client.
    Closed,
}

/// Inbound request. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Arrival time (Unix epoch milliseconds).
    pub received_at: i64,
}

impl Request {
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            received_at: now_millis(),
        }
    }
}

/// Payload of an outbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventBody {
    /// Successful handler result.
    Result {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        report_id: Option<ReportId>,
    },
    /// Structured failure for a request.
    Error(ErrorBody),
    /// Server-initiated push, not correlated to any request.
    Notification {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

impl EventBody {
    /// Error code if this is an error event.
    #[must_use]
    pub const fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error(body) => Some(body.code),
            _ => None,
        }
    }
}

/// Ordered outbound event within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Per-session sequence number, starting at 1.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub body: EventBody,
    pub created_at: i64,
}

/// Dispatch bookkeeping for one request identifier.
///
/// Entries are never removed while the session lives, so identifiers are
/// never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    InFlight { method: String, received_at: i64 },
    Completed { seq: u64 },
    Failed { code: ErrorCode },
}

impl DispatchState {
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }
}

/// Change set committed by `SessionStore::persist`.
#[derive(Debug, Clone, Default)]
pub struct SessionDelta {
    /// Events to append; their sequence numbers must continue `next_seq`.
    pub events: Vec<Event>,
    /// Drop pending events up to and including this sequence number.
    pub ack_through: Option<u64>,
    pub status: Option<SessionStatus>,
    pub dispatch: Vec<(RequestId, DispatchState)>,
}

impl SessionDelta {
    #[must_use]
    pub fn event(mut self, event: Event) -> Self {
        self.events.push(event);
        self
    }

    #[must_use]
    pub const fn ack(mut self, through: u64) -> Self {
        self.ack_through = Some(through);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn dispatch(mut self, id: RequestId, state: DispatchState) -> Self {
        self.dispatch.push((id, state));
        self
    }
}

/// Delta rejected because it would break sequence ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sequence gap: expected {expected}, got {found}")]
pub struct SequenceGap {
    pub expected: u64,
    pub found: u64,
}

/// Full session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub status: SessionStatus,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
    /// Last inbound frame or outbound delivery.
    pub last_activity: i64,
    /// Sequence number the next event will receive.
    pub next_seq: u64,
    /// Highest sequence number acknowledged by a client.
    pub last_acked: u64,
    /// Events not yet acknowledged, in sequence order.
    #[serde(default)]
    pub pending: VecDeque<Event>,
    #[serde(default)]
    pub dispatch: BTreeMap<RequestId, DispatchState>,
}

impl Session {
    /// Fresh active session with an empty event queue.
    #[must_use]
    pub fn new(now: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            next_seq: 1,
            last_acked: 0,
            pending: VecDeque::new(),
            dispatch: BTreeMap::new(),
        }
    }

    /// Highest sequence number assigned so far.
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.next_seq - 1
    }

    /// Pending events with a sequence number greater than `cursor`.
    pub fn events_after(&self, cursor: u64) -> impl Iterator<Item = &Event> {
        self.pending.iter().filter(move |e| e.seq > cursor)
    }

    /// Apply a delta in place.
    ///
    /// # Errors
    /// Returns `SequenceGap` if an appended event does not continue the
    /// sequence; the session is left untouched in that case.
    pub fn apply(&mut self, delta: &SessionDelta, now: i64) -> Result<(), SequenceGap> {
        let mut expected = self.next_seq;
        for event in &delta.events {
            if event.seq != expected {
                return Err(SequenceGap {
                    expected,
                    found: event.seq,
                });
            }
            expected += 1;
        }

        self.pending.extend(delta.events.iter().cloned());
        self.next_seq = expected;

        if let Some(through) = delta.ack_through {
            let through = through.min(self.head());
            if through > self.last_acked {
                self.last_acked = through;
            }
            while self.pending.front().is_some_and(|e| e.seq <= self.last_acked) {
                self.pending.pop_front();
            }
        }

        if let Some(status) = delta.status {
            self.status = status;
        }

        for (id, state) in &delta.dispatch {
            self.dispatch.insert(id.clone(), state.clone());
        }

        self.last_activity = self.last_activity.max(now);
        Ok(())
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            last_activity: self.last_activity,
            head: self.head(),
            last_acked: self.last_acked,
            pending: self.pending.len(),
            in_flight: self.dispatch.values().filter(|s| s.is_in_flight()).count(),
        }
    }
}

/// Lightweight view of a session for listings and status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub status: SessionStatus,
    pub created_at: i64,
    pub last_activity: i64,
    pub head: u64,
    pub last_acked: u64,
    pub pending: usize,
    pub in_flight: usize,
}

/// Stored report artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub id: ReportId,
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub created_at: i64,
    pub payload: Vec<u8>,
}

/// Report metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub id: ReportId,
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub created_at: i64,
    pub size_bytes: usize,
}
