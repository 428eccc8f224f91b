// =============================================================================
// WebSocket endpoint -- /ws/prices, 1-second live price snapshots
// =============================================================================
//
// Each connected client receives the full `{symbol: price}` map once per
// second. The handler answers Ping frames, ignores client text, and cleans
// up on disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn prices_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Manage a single client connection: push a snapshot every second while
/// draining incoming frames.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    info!("price ws client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut push = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = push.tick() => {
                let snapshot = state.prices.all();
                let json = match serde_json::to_string(&snapshot) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize price snapshot");
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Text / Binary / Pong from clients carry no meaning
                        // on this endpoint.
                        debug!("ignoring client ws frame");
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "price ws receive error");
                        break;
                    }
                }
            }
        }
    }

    info!("price ws client disconnected");
}
