//! Pool event stream

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::WS_BUFFER_SIZE;
use crate::api::server::AppState;
use crate::models::PoolEvent;

/// WebSocket handler streaming `PoolEvent`s as JSON
pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state))
}

async fn handle_events_ws(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<PoolEvent>(WS_BUFFER_SIZE);
    let mut events = state.registry.subscribe();

    info!("Events WebSocket connected");

    let mut forward_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx.try_send(event).is_err() {
                        debug!("Events WebSocket buffer full, dropping event");
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Events WebSocket lagged, missed {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize pool event: {}", e),
            }
        }
    });

    let mut receive_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!("Events WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut forward_task => {}
        _ = &mut send_task => {}
        _ = &mut receive_task => {}
    }

    forward_task.abort();
    send_task.abort();
    receive_task.abort();

    info!("Events WebSocket disconnected");
}
