use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::engine::sync::ActionOutcome;
use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/available", get(list_available))
        .route("/orders/assigned", get(list_assigned))
        .route("/orders/:id/accept", post(accept_order))
        .route("/orders/:id/decline", post(decline_order))
        .route("/orders/:id/status", patch(update_status))
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: OrderStatus,
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub order_id: String,
    pub outcome: ActionOutcome,
}

async fn list_available(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    Json(state.sync.snapshot().available.clone())
}

async fn list_assigned(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    Json(state.sync.snapshot().assigned.clone())
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    let outcome = state.sync.accept_order(&id).await?;
    Ok(Json(ActionResponse {
        order_id: id,
        outcome,
    }))
}

async fn decline_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, AppError> {
    let outcome = state.sync.decline_order(&id).await?;
    Ok(Json(ActionResponse {
        order_id: id,
        outcome,
    }))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<ActionResponse>, AppError> {
    if id.trim().is_empty() {
        return Err(AppError::BadRequest("order id cannot be empty".to_string()));
    }

    let outcome = state.sync.update_order_status(&id, payload.status).await?;
    Ok(Json(ActionResponse {
        order_id: id,
        outcome,
    }))
}
