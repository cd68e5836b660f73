use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;

use crate::models::{HealthResponse, ReadyResponse};
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(app_state): State<Arc<AppState>>) -> Json<ReadyResponse> {
    debug!("Readiness check requested");
    Json(ReadyResponse {
        status: "ok".to_string(),
        store: app_state.store_kind.to_string(),
        live_channels: app_state.hub.channel_count().await as u32,
    })
}
