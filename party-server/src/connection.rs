//! Per-player WebSocket handling.
//!
//! Every connection is upgraded, split, and served by a receive loop in the
//! connection task plus a spawned send task that drains the player's
//! outbound channel. Frames are JSON text; an undecodable frame is logged
//! and ignored, it never disconnects the player. When the socket goes away
//! the player is treated as gracefully leaving its session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, PlayerId, ServerMessage};
use tokio::sync::mpsc;

use crate::lobby::{AppState, disconnect_player, handle_client_message};

/// Upgrades the request into the socket handler.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| websocket(socket, state))
}

/// Serves one connection from upgrade to disconnect.
async fn websocket(stream: WebSocket, state: Arc<AppState>) {
    // By splitting, we can send and receive at the same time.
    let (sink, stream) = stream.split();
    let (sender, outbound) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(send_loop(sink, outbound));

    let identity = receive_loop(stream, &state, &sender).await;

    // The channel closes with the sender, which ends the send task; the
    // abort only covers a sink that is stuck.
    drop(sender);
    send_task.abort();

    if let Some(player) = identity {
        disconnect_player(&state, player).await;
    }
}

/// Encodes and ships outbound messages in order. An encoding error drops
/// only the offending message.
async fn send_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(error) => {
                tracing::error!(?error, "Failed to encode server message, dropping it.");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
}

/// Decodes inbound frames and routes them. Returns the player identity the
/// connection established, for the disconnect cleanup.
async fn receive_loop(
    mut stream: SplitStream<WebSocket>,
    state: &Arc<AppState>,
    sender: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<PlayerId> {
    let mut identity: Option<PlayerId> = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    handle_client_message(state, &mut identity, sender, message).await;
                }
                Err(error) => {
                    tracing::warn!(?error, "Undecodable client frame, ignoring.");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ping/pong and binary frames are not part of the protocol.
            Err(_) => break,
        }
    }
    identity
}
