//! API route definitions

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::api::{handlers, middleware};
use crate::repository::InMemoryTaskStore;
use crate::supervisor::TaskSupervisor;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<TaskSupervisor>,
    /// Present when the server runs on the in-memory store
    pub inputs: Option<Arc<InMemoryTaskStore>>,
}

/// Build the complete API router
pub fn create_router(
    supervisor: Arc<TaskSupervisor>,
    inputs: Option<Arc<InMemoryTaskStore>>,
) -> Router {
    let state = AppState { supervisor, inputs };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/llm/status", get(handlers::llm_status))
        .route(
            "/api/v1/tasks/:pipeline/:entity_id",
            post(handlers::submit_task),
        )
        .route(
            "/api/v1/tasks/:pipeline/:entity_id/status",
            get(handlers::task_status),
        )
        .route("/api/v1/inputs/:entity_id", put(handlers::put_input))
        .layer(middleware::logging_layer())
        .layer(middleware::cors_layer())
        .with_state(state)
}
