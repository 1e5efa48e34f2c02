use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::client::TokenProvider;
use crate::engine::sync::EngineStatus;
use crate::error::AppError;
use crate::models::driver::DriverAvailability;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/engine/status", get(status))
        .route("/engine/start", post(start))
        .route("/engine/stop", post(stop))
        .route("/engine/enable", post(enable))
        .route("/engine/disable", post(disable))
        .route("/engine/refresh", post(refresh))
        .route("/lifecycle/foreground", post(foreground))
        .route("/lifecycle/background", post(background))
        .route("/driver/availability", put(set_availability))
        .route("/session/token", put(set_token).delete(clear_token))
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub token: String,
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<EngineStatus>, AppError> {
    Ok(Json(state.sync.status().await?))
}

async fn start(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.start().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.stop().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn enable(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.enable().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn disable(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.disable().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn refresh(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.refresh().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn foreground(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.enter_foreground().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn background(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.sync.enter_background().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn set_availability(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DriverAvailability>,
) -> Json<DriverAvailability> {
    state.availability.set(payload);
    Json(payload)
}

async fn set_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TokenRequest>,
) -> Result<StatusCode, AppError> {
    if payload.token.trim().is_empty() {
        return Err(AppError::BadRequest("token cannot be empty".to_string()));
    }

    let had_token = state.tokens.auth_token().is_some();
    state.tokens.set_token(payload.token);
    if had_token {
        // Different driver context: start over with fresh seen-sets.
        state.sync.reset_session().await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_token(State(state): State<Arc<AppState>>) -> Result<StatusCode, AppError> {
    state.tokens.clear();
    state.sync.stop().await?;
    state.sync.reset_session().await?;
    Ok(StatusCode::NO_CONTENT)
}
