//! Liveness and LLM status

use axum::{extract::State, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::api::{response, routes::AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub workers: usize,
    pub active_tasks: usize,
}

/// Handler for GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    response::ok(HealthResponse {
        status: "ok".to_string(),
        version: crate::version().to_string(),
        workers: state.supervisor.worker_count(),
        active_tasks: state.supervisor.active_count(),
    })
}

/// Handler for GET /api/v1/llm/status
///
/// Model, endpoint, whether a key is configured, and the gate counters.
pub async fn llm_status(State(state): State<AppState>) -> impl IntoResponse {
    response::ok(state.supervisor.llm_status())
}
