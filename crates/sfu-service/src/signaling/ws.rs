//! WebSocket transport for signaling.
//!
//! One task per connection. The task multiplexes three sources: client
//! frames (answered in order, one response each), room events queued by the
//! [`RoomHub`](super::hub::RoomHub), and service shutdown. When the socket
//! closes for any reason the peer is cleaned up as if it had left.

use super::connection::{SignalingConnection, SignalingContext};
use super::messages::{ServerMessage, UNPARSEABLE_REQUEST_ID};
use crate::errors::SfuError;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Queued room events per connection before events start being dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Largest accepted client frame.
const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct SignalingState {
    ctx: Arc<SignalingContext>,
    shutdown: CancellationToken,
}

/// Router serving `GET /ws`.
///
/// Open connections close when `shutdown` is cancelled.
pub fn signaling_router(ctx: Arc<SignalingContext>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(SignalingState { ctx, shutdown })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| run_connection(socket, state.ctx, state.shutdown))
}

async fn send_frame(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    match message.to_json() {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            error!(target: "sfu.signaling.ws", error = %e, "Failed to encode frame");
            Ok(())
        }
    }
}

async fn run_connection(
    mut socket: WebSocket,
    ctx: Arc<SignalingContext>,
    shutdown: CancellationToken,
) {
    let (outbound, mut events) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let mut connection = SignalingConnection::new(ctx, outbound);
    let peer_id = connection.peer_id();
    info!(target: "sfu.signaling.ws", peer_id = %peer_id, "Signaling connection opened");

    loop {
        tokio::select! {
            frame = socket.recv() => {
                let reply = match frame {
                    Some(Ok(Message::Text(text))) => connection.handle_text(&text).await,
                    Some(Ok(Message::Binary(_))) => ServerMessage::from_error(
                        UNPARSEABLE_REQUEST_ID,
                        &SfuError::InvalidRequest("binary frames are not supported".to_string()),
                    ),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(target: "sfu.signaling.ws", peer_id = %peer_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                };
                if let Err(e) = send_frame(&mut socket, &reply).await {
                    debug!(target: "sfu.signaling.ws", peer_id = %peer_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            Some(event) = events.recv() => {
                if let Err(e) = send_frame(&mut socket, &event).await {
                    debug!(target: "sfu.signaling.ws", peer_id = %peer_id, error = %e, "WebSocket send failed");
                    break;
                }
            }
            () = shutdown.cancelled() => {
                // Best effort, the peer is cleaned up either way.
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    connection.handle_disconnect().await;
    info!(target: "sfu.signaling.ws", peer_id = %peer_id, "Signaling connection closed");
}
