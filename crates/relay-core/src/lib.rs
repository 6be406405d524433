//! Core abstractions for the MCP relay.
//!
//! This crate provides the fundamental building blocks:
//! - `Session`, `Request`, `Event`, `Report` - the data model
//! - `EventFeed` - ordered replay + live delivery for reconnection support
//! - `SessionStore` and `ReportSink` traits
//! - `ErrorCode` / `ErrorBody` - the wire error taxonomy
//! - `RelayConfig` - runtime configuration

pub mod config;
pub mod error;
pub mod feed;
pub mod sweep;
pub mod traits;
pub mod types;

pub use config::RelayConfig;
pub use error::{Coded, ErrorBody, ErrorCode};
pub use feed::{EventFeed, FeedCursor};
pub use sweep::{SweepPolicy, SweepReport, plan_sweep};
pub use traits::{ReportError, ReportSink, SessionFilter, SessionStore, StorageError, StorageStats};
pub use types::{
    DispatchState, Event, EventBody, Report, ReportId, ReportMeta, Request, RequestId, Session,
    SessionDelta, SessionId, SessionStatus, SessionSummary, now_millis,
};
