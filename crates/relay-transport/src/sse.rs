//! Server-sent events transport.
//!
//! `GET /sse` performs the handshake and streams events; clients send
//! frames with `POST /messages?session_id=..`.

use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
};
use futures::{
    Stream, StreamExt,
    stream::{self, BoxStream},
};
use relay_core::{Request, SessionId};
use relay_session::Handshake;
use serde::Deserialize;
use tracing::{debug, error};

use crate::{
    connection::{Attached, Connection},
    error::TransportError,
    protocol::{ClientMessage, ServerMessage},
    router::AppState,
};

/// Path clients post frames to.
pub const MESSAGES_PATH: &str = "/messages";

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub session_id: Option<SessionId>,
    pub last_seen: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub session_id: SessionId,
    #[serde(default)]
    pub wait: bool,
}

/// SSE body that keeps its connection attached until the body is dropped.
struct AttachedStream {
    events: BoxStream<'static, SseEvent>,
    _attached: Attached,
}

impl Stream for AttachedStream {
    type Item = Result<SseEvent, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx).map(|event| event.map(Ok))
    }
}

fn frame(kind: &'static str, message: &ServerMessage) -> SseEvent {
    SseEvent::default()
        .event(kind)
        .json_data(message)
        .unwrap_or_else(|e| {
            error!("Failed to serialize message: {e}");
            SseEvent::default().event("error").data(e.to_string())
        })
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `GET /sse` handler.
///
/// # Errors
/// `NotFound`/`Expired` when resuming an unusable session.
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, TransportError> {
    let coordinator = state.coordinator.clone();
    let config = coordinator.config().clone();

    let mut connection = Connection::new();
    connection
        .begin_handshake()
        .map_err(|e| TransportError::invalid_frame(e.to_string()))?;

    let handshake = Handshake {
        session_id: query.session_id,
        last_seen: query.last_seen.or_else(|| last_event_id(&headers)),
    };
    let attachment = coordinator.open(handshake).await?;
    let session_id = attachment.session_id;
    connection
        .establish(session_id)
        .map_err(|e| TransportError::invalid_frame(e.to_string()))?;
    debug!(connection = %connection.id(), %session_id, "SSE stream attached");

    let endpoint = SseEvent::default()
        .event("endpoint")
        .data(format!("{MESSAGES_PATH}?session_id={session_id}"));
    let welcome = frame(
        "welcome",
        &ServerMessage::Welcome {
            session_id,
            resumed: attachment.resumed,
            last_acked: attachment.last_acked,
            head: attachment.head,
        },
    );

    let events = attachment.events(config.max_unacked_events).map(|event| {
        frame("message", &ServerMessage::Event(event.clone())).id(event.seq.to_string())
    });
    let stream = AttachedStream {
        events: stream::iter([endpoint, welcome]).chain(events).boxed(),
        _attached: Attached::new(connection, coordinator, config.keepalive_interval),
    };

    Ok(Sse::new(stream).keep_alive(keep_alive(config.keepalive_interval)))
}

fn keep_alive(interval: Duration) -> KeepAlive {
    KeepAlive::new().interval(interval).text("keepalive")
}

/// `POST /messages` handler.
///
/// # Errors
/// 400 for malformed frames, 404/410 for unusable sessions, 409 for reused
/// request identifiers.
pub async fn message_handler(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Result<Response, TransportError> {
    let coordinator = &state.coordinator;
    let session_id = query.session_id;

    let message = ClientMessage::parse(&body).map_err(TransportError::Frame)?;
    match message {
        ClientMessage::Request { id, method, params } => {
            let handle = coordinator
                .submit(session_id, Request::new(id, method, params))
                .await?;
            if query.wait {
                let event = handle.wait().await.map_err(TransportError::Delivery)?;
                return Ok(Json(ServerMessage::Event(event)).into_response());
            }
            Ok((
                StatusCode::ACCEPTED,
                Json(ServerMessage::Accepted {
                    request_id: handle.request_id,
                    coalesced: handle.coalesced,
                }),
            )
                .into_response())
        }
        ClientMessage::Ack { seq } => {
            let last_acked = coordinator.ack(session_id, seq).await?;
            Ok(Json(ServerMessage::Acked { last_acked }).into_response())
        }
        ClientMessage::Close => {
            coordinator.close(session_id).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        ClientMessage::Ping => {
            coordinator.touch(session_id).await?;
            Ok(Json(ServerMessage::Pong).into_response())
        }
        ClientMessage::Hello { .. } => Err(TransportError::invalid_frame(
            "hello is only valid as the first WebSocket frame; open GET /sse instead",
        )),
    }
}
