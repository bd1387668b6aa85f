// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Operational endpoints only: health, state snapshot, stream table, and the
// kill-switch control. CORS is configured permissively for development;
// tighten `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;

// =============================================================================
// Router construction
// =============================================================================

/// Build the REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/streams", get(streams))
        .route("/api/v1/control/kill", post(control_kill))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    run_id: String,
    state_version: u64,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        run_id: state.run_id.clone(),
        state_version: state.current_state_version(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// State snapshot
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot().await)
}

// =============================================================================
// Streams
// =============================================================================

async fn streams(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.engine.lock().await;
    Json(engine.stream_summaries())
}

// =============================================================================
// Kill switch
// =============================================================================

/// Engage the kill switch by writing its flag file. The risk gate reads the
/// file on every submission, so this takes effect immediately.
async fn control_kill(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let path = state.kill_switch.path();
    match std::fs::write(path, "true") {
        Ok(()) => {
            warn!(path = %path.display(), "kill switch engaged via API");
            state.increment_version();
            (StatusCode::OK, Json(serde_json::json!({ "killed": true })))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to engage kill switch");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "killed": false, "error": e.to_string() })),
            )
        }
    }
}
