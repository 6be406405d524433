//! Per-connection lifecycle.

use std::time::Duration;

use relay_core::SessionId;
use relay_session::SessionCoordinator;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Streaming,
    Draining,
    Closed,
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid connection transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// A single client connection.
///
/// Connections are disposable: dropping one never affects the session
/// beyond marking it idle once no other connection is attached.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    state: ConnectionState,
    session_id: Option<SessionId>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Connecting,
            session_id: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    fn advance(&mut self, to: ConnectionState) -> Result<(), InvalidTransition> {
        use ConnectionState::{Closed, Connecting, Draining, Handshaking, Streaming};

        let allowed = matches!(
            (self.state, to),
            (Connecting, Handshaking)
                | (Handshaking, Streaming)
                | (Connecting | Handshaking | Streaming, Draining)
                | (Draining, Closed)
        );
        if !allowed {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(connection = %self.id, from = ?self.state, ?to, "Connection transition");
        self.state = to;
        Ok(())
    }

    /// First frame or request received.
    ///
    /// # Errors
    /// Fails unless the connection is still connecting.
    pub fn begin_handshake(&mut self) -> Result<(), InvalidTransition> {
        self.advance(ConnectionState::Handshaking)
    }

    /// Session resolved; events may flow.
    ///
    /// # Errors
    /// Fails unless a handshake is in progress.
    pub fn establish(&mut self, session_id: SessionId) -> Result<(), InvalidTransition> {
        self.advance(ConnectionState::Streaming)?;
        self.session_id = Some(session_id);
        Ok(())
    }

    /// Stop delivering; unacknowledged events stay with the session.
    pub fn drain(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Handshaking | ConnectionState::Streaming
        ) {
            let _ = self.advance(ConnectionState::Draining);
        }
    }

    /// Discard the connection.
    pub fn close(&mut self) {
        self.drain();
        if self.state == ConnectionState::Draining {
            let _ = self.advance(ConnectionState::Closed);
        }
    }
}

/// Keeps an established connection attached to its session.
///
/// Touches the session every `keepalive` so an attached client never
/// expires, and detaches from the coordinator when dropped.
pub struct Attached {
    connection: Connection,
    coordinator: SessionCoordinator,
    keepalive: JoinHandle<()>,
}

impl Attached {
    #[must_use]
    pub fn new(
        connection: Connection,
        coordinator: SessionCoordinator,
        keepalive: Duration,
    ) -> Self {
        let task = connection.session_id().map_or_else(
            || tokio::spawn(async {}),
            |session_id| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    let mut ticks = tokio::time::interval(keepalive);
                    ticks.tick().await;
                    loop {
                        ticks.tick().await;
                        if let Err(e) = coordinator.touch(session_id).await {
                            debug!(%session_id, "Keepalive stopped: {e}");
                            break;
                        }
                    }
                })
            },
        );
        Self {
            connection,
            coordinator,
            keepalive: task,
        }
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.connection.close();
        if let Some(session_id) = self.connection.session_id() {
            info!(connection = %self.connection.id(), %session_id, "Connection closed");
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let coordinator = self.coordinator.clone();
                runtime.spawn(async move { coordinator.detach(session_id).await });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut conn = Connection::new();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.begin_handshake().unwrap();
        let session = Uuid::new_v4();
        conn.establish(session).unwrap();
        assert_eq!(conn.state(), ConnectionState::Streaming);
        assert_eq!(conn.session_id(), Some(session));
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_cannot_stream_without_handshake() {
        let mut conn = Connection::new();
        let err = conn.establish(Uuid::new_v4()).unwrap_err();
        assert_eq!(err.from, ConnectionState::Connecting);
        assert_eq!(err.to, ConnectionState::Streaming);
        assert!(conn.session_id().is_none());
    }

    #[test]
    fn test_failed_handshake_still_closes() {
        let mut conn = Connection::new();
        conn.begin_handshake().unwrap();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.begin_handshake().is_err());
    }
}
