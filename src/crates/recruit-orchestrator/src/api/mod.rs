//! HTTP surface of the task server
//!
//! A thin axum layer over [`crate::TaskSupervisor`]:
//! - submit a pipeline task for an entity
//! - poll its progress
//! - seed entity input (standalone in-memory mode)
//! - LLM and health status

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiErrorResponse, ApiResult};
pub use middleware::{cors_layer, logging_layer};
pub use response::SuccessResponse;
pub use routes::{create_router, AppState};
