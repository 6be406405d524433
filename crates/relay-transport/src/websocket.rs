//! WebSocket transport.
//!
//! The first frame must be `hello`; the server answers with `welcome` and
//! then streams events on the same socket. A malformed frame closes only
//! this socket.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{
    SinkExt, StreamExt,
    stream::{BoxStream, SplitStream},
};
use relay_core::{Coded, ErrorBody, ErrorCode, Event, Request};
use relay_session::{Handshake, SessionCoordinator};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    connection::{Attached, Connection},
    protocol::{ClientMessage, ServerMessage},
    router::AppState,
};

/// Control replies queued per connection before the reader waits.
const CONTROL_QUEUE: usize = 32;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.coordinator))
}

enum Frame {
    Message(ClientMessage),
    Skip,
    End,
}

async fn next_frame(receiver: &mut SplitStream<WebSocket>) -> Result<Frame, ErrorBody> {
    let Some(msg) = receiver.next().await else {
        return Ok(Frame::End);
    };
    let bytes = match msg {
        Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
        Ok(Message::Binary(data)) => data.to_vec(),
        Ok(Message::Close(_)) => return Ok(Frame::End),
        Ok(_) => return Ok(Frame::Skip),
        Err(e) => {
            warn!("WebSocket error: {e}");
            return Ok(Frame::End);
        }
    };
    ClientMessage::parse(&bytes).map(Frame::Message)
}

/// Everything written to the socket after the handshake.
///
/// Control replies and session events share the socket. The event half ends
/// when `stop` fires; the whole stream ends once the replies are drained too.
fn outbound(
    welcome: ServerMessage,
    replies: mpsc::Receiver<ServerMessage>,
    events: BoxStream<'static, Event>,
    stop: oneshot::Receiver<()>,
) -> BoxStream<'static, ServerMessage> {
    let events = events.map(ServerMessage::Event).take_until(stop);
    futures::stream::iter([welcome])
        .chain(tokio_stream::StreamExt::merge(
            ReceiverStream::new(replies),
            events,
        ))
        .boxed()
}

async fn send_direct(socket: &mut WebSocket, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = socket.send(Message::Text(json.into())).await;
        }
        Err(e) => tracing::error!("Failed to serialize message: {e}"),
    }
}

async fn handshake(socket: &mut WebSocket) -> Result<Handshake, ErrorBody> {
    loop {
        let Some(msg) = socket.recv().await else {
            return Err(ErrorBody::new(ErrorCode::InvalidFrame, "closed before hello"));
        };
        let bytes = match msg {
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => {
                return Err(ErrorBody::new(ErrorCode::InvalidFrame, "closed before hello"));
            }
        };
        return match ClientMessage::parse(&bytes)? {
            ClientMessage::Hello {
                session_id,
                last_seen,
            } => Ok(Handshake {
                session_id,
                last_seen,
            }),
            _ => Err(ErrorBody::new(
                ErrorCode::InvalidFrame,
                "first frame must be hello",
            )),
        };
    }
}

async fn handle_socket(mut socket: WebSocket, coordinator: SessionCoordinator) {
    let mut connection = Connection::new();
    let _ = connection.begin_handshake();

    let attachment = match handshake(&mut socket).await {
        Ok(handshake) => match coordinator.open(handshake).await {
            Ok(attachment) => attachment,
            Err(e) => {
                send_direct(&mut socket, &ServerMessage::Error(e.to_body())).await;
                connection.close();
                return;
            }
        },
        Err(body) => {
            debug!(connection = %connection.id(), "Handshake rejected: {}", body.message);
            send_direct(&mut socket, &ServerMessage::Error(body)).await;
            connection.close();
            return;
        }
    };

    let session_id = attachment.session_id;
    if connection.establish(session_id).is_err() {
        return;
    }
    let config = coordinator.config().clone();
    let attached = Attached::new(connection, coordinator.clone(), config.keepalive_interval);

    let welcome = ServerMessage::Welcome {
        session_id,
        resumed: attachment.resumed,
        last_acked: attachment.last_acked,
        head: attachment.head,
    };

    let (mut sender, mut receiver) = socket.split();

    // Each send waits for the sink, so at most one event is in flight.
    let (tx, rx) = mpsc::channel::<ServerMessage>(CONTROL_QUEUE);
    let (stop_events, stop) = oneshot::channel();
    let mut frames = outbound(
        welcome,
        rx,
        attachment.events(config.max_unacked_events),
        stop,
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = frames.next().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let feed = attachment.feed;
    loop {
        let frame = tokio::select! {
            frame = next_frame(&mut receiver) => frame,
            () = feed.closed() => {
                debug!(%session_id, "Event feed closed, ending socket");
                break;
            }
        };
        let message = match frame {
            Ok(Frame::Message(message)) => message,
            Ok(Frame::Skip) => continue,
            Ok(Frame::End) => break,
            Err(body) => {
                warn!(%session_id, "Invalid client message: {}", body.message);
                let _ = tx.send(ServerMessage::Error(body)).await;
                break;
            }
        };

        let reply = match message {
            ClientMessage::Request { id, method, params } => {
                match coordinator
                    .submit(session_id, Request::new(id, method, params))
                    .await
                {
                    Ok(handle) => ServerMessage::Accepted {
                        request_id: handle.request_id,
                        coalesced: handle.coalesced,
                    },
                    Err(e) => ServerMessage::Error(e.to_body()),
                }
            }
            ClientMessage::Ack { seq } => match coordinator.ack(session_id, seq).await {
                Ok(last_acked) => ServerMessage::Acked { last_acked },
                Err(e) => ServerMessage::Error(e.to_body()),
            },
            ClientMessage::Ping => match coordinator.touch(session_id).await {
                Ok(()) => ServerMessage::Pong,
                Err(e) => ServerMessage::Error(e.to_body()),
            },
            ClientMessage::Close => {
                if let Err(e) = coordinator.close(session_id).await {
                    let _ = tx.send(ServerMessage::Error(e.to_body())).await;
                }
                break;
            }
            ClientMessage::Hello { .. } => {
                let _ = tx
                    .send(ServerMessage::Error(ErrorBody::new(
                        ErrorCode::InvalidFrame,
                        "session already established",
                    )))
                    .await;
                break;
            }
        };
        if tx.send(reply).await.is_err() {
            break;
        }
    }

    // Let queued replies flush, then stop streaming.
    drop(tx);
    let _ = stop_events.send(());
    let abort = send_task.abort_handle();
    if tokio::time::timeout(std::time::Duration::from_secs(1), send_task)
        .await
        .is_err()
    {
        abort.abort();
    }
    drop(attached);
}
