//! src/api/ws.rs
//!
//! Handles WebSocket connection logic for the visualizer API.

use crate::api::ApiState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};

/// The handler for WebSocket upgrade requests.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Manages a single WebSocket connection, sending an initial snapshot and
/// then every subsequent one as the network changes.
async fn handle_socket(mut socket: WebSocket, state: ApiState) {
    tracing::info!("New WebSocket client connected.");
    let mut snapshot_rx = state.snapshot_rx.clone();

    let initial = snapshot_rx.borrow().clone();
    let initial_json = serde_json::to_string(&initial).expect("Failed to serialize initial snapshot");

    if socket.send(Message::Text(initial_json)).await.is_err() {
        tracing::warn!("Failed to send initial snapshot to WebSocket client. Closing.");
        return;
    }

    loop {
        tokio::select! {
            Ok(_) = snapshot_rx.changed() => {
                let snapshot = snapshot_rx.borrow().clone();
                let json = match serde_json::to_string(&snapshot) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize network snapshot");
                        continue;
                    }
                };

                if socket.send(Message::Text(json)).await.is_err() {
                    tracing::info!("WebSocket client disconnected.");
                    break;
                }
            }
            Some(Ok(msg)) = socket.recv() => {
                if let Message::Close(_) = msg {
                    tracing::info!("WebSocket client sent close message.");
                    break;
                }
            }
            else => {
                tracing::info!("WebSocket connection closed or snapshot channel dropped.");
                break;
            }
        }
    }
}
