use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /health/ready — ready only when the LLM backend answers its liveness
/// probe.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.llm.is_available().await {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "llm_unavailable" })),
        )
    }
}
