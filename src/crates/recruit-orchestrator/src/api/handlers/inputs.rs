//! Entity input seeding for the standalone in-memory server

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::api::{error::ApiError, response, routes::AppState};
use crate::input::PipelineInput;

/// Handler for PUT /api/v1/inputs/:entity_id
pub async fn put_input(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(input): Json<PipelineInput>,
) -> Result<impl IntoResponse, ApiError> {
    let store = state
        .inputs
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("input seeding is not enabled".to_string()))?;

    let entity_id = entity_id.trim().to_string();
    if entity_id.is_empty() {
        return Err(ApiError::BadRequest("entity id must not be empty".to_string()));
    }

    store.insert_input(entity_id.clone(), input);
    tracing::info!(entity_id = %entity_id, "Entity input stored");
    Ok(response::ok(json!({ "entity_id": entity_id })))
}
