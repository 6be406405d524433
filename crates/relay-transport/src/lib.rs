//! Transports for the MCP relay.
//!
//! Provides:
//! - Wire protocol (JSON, `type`-tagged)
//! - SSE transport with `POST /messages` for client frames
//! - WebSocket transport (feature: websocket)
//! - Session, report and statistics endpoints

pub mod connection;
pub mod error;
pub mod protocol;
pub mod router;
pub mod sse;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{Connection, ConnectionState};
pub use error::TransportError;
pub use protocol::{ClientMessage, ServerMessage};
pub use router::{AppState, create_router};
