use super::{ApiError, ApiState};

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use std::sync::Arc;

pub(super) async fn get_document(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let content = state
        .world_model
        .load()
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "content": content })))
}

#[derive(Deserialize)]
pub(super) struct PutDocumentRequest {
    content: String,
}

pub(super) async fn put_document(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PutDocumentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("world model must not be empty"));
    }
    state
        .world_model
        .replace_content(&request.content)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    tracing::info!("world model replaced via API");
    Ok(Json(serde_json::json!({ "bytes": request.content.len() })))
}
