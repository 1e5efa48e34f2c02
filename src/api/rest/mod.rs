pub mod control;
pub mod orders;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::engine::reconnect::ConnectionState;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(orders::router())
        .merge(control::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connected: bool,
    /// `None` once the engine task has exited.
    delivery: Option<DeliveryPath>,
    available: usize,
    assigned: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum DeliveryPath {
    Push,
    Polling,
    Idle,
}

/// Always answers 200 while the process serves requests; `status` degrades
/// when the engine is gone.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let snapshot = state.sync.snapshot();
    let delivery = state.sync.status().await.ok().map(|status| {
        if status.connection == ConnectionState::Connected {
            DeliveryPath::Push
        } else if status.polling {
            DeliveryPath::Polling
        } else {
            DeliveryPath::Idle
        }
    });

    Json(HealthResponse {
        status: if delivery.is_some() { "ok" } else { "degraded" },
        connected: snapshot.connected,
        delivery,
        available: snapshot.available.len(),
        assigned: snapshot.assigned.len(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
