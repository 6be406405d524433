//! Wire protocol for client-server communication.

use relay_core::{ErrorBody, ErrorCode, Event, RequestId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open or resume a session (WebSocket handshake).
    Hello {
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default)]
        last_seen: Option<u64>,
    },
    /// Invoke a method.
    Request {
        id: RequestId,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Acknowledge events through `seq`.
    Ack { seq: u64 },
    /// Close the session for good.
    Close,
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse one inbound frame.
    ///
    /// # Errors
    /// Returns an `invalid_frame` error body describing the parse failure.
    pub fn parse(frame: &[u8]) -> Result<Self, ErrorBody> {
        serde_json::from_slice(frame)
            .map_err(|e| ErrorBody::new(ErrorCode::InvalidFrame, format!("Invalid message: {e}")))
    }
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Welcome {
        session_id: SessionId,
        resumed: bool,
        last_acked: u64,
        head: u64,
    },
    /// Ordered session event.
    Event(Event),
    /// Request accepted for dispatch.
    Accepted {
        request_id: RequestId,
        coalesced: bool,
    },
    /// Acknowledgement recorded.
    Acked { last_acked: u64 },
    /// Transport-level error, not tied to the event sequence.
    Error(ErrorBody),
    /// Pong response.
    Pong,
}

#[cfg(test)]
mod tests {
    use relay_core::EventBody;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_accepts_numeric_id() {
        let msg = ClientMessage::parse(br#"{"type":"request","id":7,"method":"echo"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Request {
                id: RequestId::from("7"),
                method: "echo".into(),
                params: Value::Null,
            }
        );
    }

    #[test]
    fn test_hello_fields_are_optional() {
        let msg = ClientMessage::parse(br#"{"type":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello {
                session_id: None,
                last_seen: None
            }
        );
    }

    #[test]
    fn test_malformed_frame_is_invalid_frame() {
        let err = ClientMessage::parse(b"{not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFrame);
        let err = ClientMessage::parse(br#"{"type":"resize"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFrame);
    }

    #[test]
    fn test_event_serialization() {
        let msg = ServerMessage::Event(Event {
            seq: 3,
            request_id: Some(RequestId::from("a")),
            body: EventBody::Result {
                value: json!("hi"),
                report_id: None,
            },
            created_at: 10,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["request_id"], "a");
        assert_eq!(value["body"]["kind"], "result");
        assert_eq!(value["body"]["value"], "hi");

        let error = ServerMessage::Error(ErrorBody::new(ErrorCode::Expired, "gone"));
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "expired");
    }
}
