use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::engine::store::OrdersSnapshot;
use crate::state::AppState;

fn snapshot_frame(orders: &OrdersSnapshot) -> Result<String, serde_json::Error> {
    serde_json::to_string(&json!({ "type": "snapshot", "orders": orders }))
}

/// Requests a UI client may send back.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UiRequest {
    Refresh,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before reading the snapshot so no event falls in between.
    let mut events = BroadcastStream::new(state.sync.subscribe());

    info!("ui client connected");

    let snapshot = state.sync.snapshot();
    if !send_frame(&mut sender, snapshot_frame(&snapshot)).await {
        return;
    }

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => {
                    if !send_frame(&mut sender, serde_json::to_string(&event)).await {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "ui client lagging; events dropped");
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<UiRequest>(&text) {
                    Ok(UiRequest::Refresh) => {
                        if let Err(err) = state.sync.refresh().await {
                            warn!(error = %err, "ui refresh request failed");
                        }
                    }
                    Err(err) => debug!(error = %err, "ignoring ui message"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "ui socket read failed");
                    break;
                }
            },
        }
    }

    info!("ui client disconnected");
}

/// Returns false once the client is gone.
async fn send_frame<S>(sender: &mut S, frame: Result<String, serde_json::Error>) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    let json = match frame {
        Ok(json) => json,
        Err(err) => {
            warn!(error = %err, "failed to serialize ui frame");
            return true;
        }
    };
    sender.send(Message::Text(json)).await.is_ok()
}
