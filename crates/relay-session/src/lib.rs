//! Session storage and coordination for the MCP relay.
//!
//! Provides:
//! - `SessionCoordinator` - single writer per session: ordering, dispatch,
//!   coalescing, acknowledgement and expiry
//! - Storage implementations (filesystem, memory)

pub mod coordinator;
pub mod storage;

pub use coordinator::{
    Attachment, Completion, CoordinatorError, Handshake, SessionCoordinator, SubmitHandle,
};
#[cfg(feature = "memory")]
pub use storage::MemoryStore;
pub use storage::FileSessionStore;
