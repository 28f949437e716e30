//! Task submission and progress polling

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::Value;

use crate::api::{error::ApiError, response, routes::AppState};
use crate::task::{PipelineKind, TaskIdentity};

fn identity(pipeline: &str, entity_id: &str) -> Result<TaskIdentity, ApiError> {
    let kind = pipeline.parse::<PipelineKind>().map_err(ApiError::BadRequest)?;
    let entity_id = entity_id.trim();
    if entity_id.is_empty() {
        return Err(ApiError::BadRequest("entity id must not be empty".to_string()));
    }
    Ok(TaskIdentity::new(kind, entity_id))
}

/// Submission parameters: an empty body or a JSON object
fn parameters(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(ApiError::BadRequest(
            "parameters must be a JSON object".to_string(),
        )),
        Err(e) => Err(ApiError::BadRequest(format!("invalid JSON: {}", e))),
    }
}

/// Handler for POST /api/v1/tasks/:pipeline/:entity_id
///
/// 202 with the task handle; 409 while a task for the identity is live.
pub async fn submit_task(
    State(state): State<AppState>,
    Path((pipeline, entity_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let identity = identity(&pipeline, &entity_id)?;
    let parameters = parameters(&body)?;

    let handle = state.supervisor.submit(identity, parameters).await?;
    Ok(response::accepted(handle))
}

/// Handler for GET /api/v1/tasks/:pipeline/:entity_id/status
pub async fn task_status(
    State(state): State<AppState>,
    Path((pipeline, entity_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = identity(&pipeline, &entity_id)?;
    let view = state.supervisor.status(&identity).await?;
    Ok(response::ok(view))
}
