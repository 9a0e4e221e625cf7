//! WebAPI - Process control surface
//!
//! ## Responsibilities
//!
//! - Liveness (`/healthz`)
//! - Stream listing and status
//! - Start / stop of stream sessions

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let inference_ok = state.inference.health_check().await;

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        streams_running: state.streams.running_count().await,
        inference_connected: inference_ok,
    };

    Json(response)
}
