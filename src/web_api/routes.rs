//! API Routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::models::ApiResponse;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Streams
        .route("/api/streams", get(list_streams))
        .route("/api/streams/:id", get(get_stream))
        .route("/api/streams/:id/start", post(start_stream))
        .route("/api/streams/:id/stop", post(stop_stream))
        .with_state(state)
}

// ========================================
// Stream Handlers
// ========================================

async fn list_streams(State(state): State<AppState>) -> impl IntoResponse {
    let streams = state.streams.list().await;
    Json(ApiResponse::success(streams))
}

async fn get_stream(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.streams.status(&id).await {
        Ok(status) => Json(ApiResponse::success(status)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.streams.start(&id).await {
        Ok(status) => (StatusCode::ACCEPTED, Json(ApiResponse::success(status))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop_stream(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.streams.stop(&id).await {
        Ok(status) => Json(ApiResponse::success(status)).into_response(),
        Err(e) => e.into_response(),
    }
}
