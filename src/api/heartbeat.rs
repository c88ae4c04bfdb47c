use super::{ApiError, ApiState};
use crate::llm::ModelRef;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use std::sync::Arc;

pub(super) async fn get_config(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let config = &state.config;
    Json(serde_json::json!({
        "enabled": config.heartbeat_enabled,
        "interval_ms": config.heartbeat_interval.as_millis() as u64,
        "active_start": config.heartbeat_active_start,
        "active_end": config.heartbeat_active_end,
        "delivery": config.heartbeat_delivery,
        "model_override": state.config_store.heartbeat_model().map(|m| m.to_string()),
    }))
}

pub(super) async fn get_content(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = state.heartbeat.instruction_path();
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(error) => return Err(ApiError::internal(error.to_string())),
    };
    Ok(Json(serde_json::json!({ "content": content })))
}

#[derive(Deserialize)]
pub(super) struct PutContentRequest {
    content: String,
}

pub(super) async fn put_content(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PutContentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let path = state.heartbeat.instruction_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|error| ApiError::internal(error.to_string()))?;
    }
    std::fs::write(&path, &request.content)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "bytes": request.content.len() })))
}

#[derive(Deserialize)]
pub(super) struct RunsQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_runs_limit")]
    limit: usize,
}

fn default_runs_limit() -> usize {
    20
}

pub(super) async fn runs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RunsQuery>,
) -> Json<serde_json::Value> {
    let runs = state.heartbeat.read_runs(query.offset, query.limit.min(200));
    Json(serde_json::json!({ "runs": runs }))
}

pub(super) async fn get_model(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ref": state.config_store.heartbeat_model().map(|m| m.to_string()),
    }))
}

#[derive(Deserialize)]
pub(super) struct PutModelRequest {
    #[serde(rename = "ref")]
    model_ref: String,
}

pub(super) async fn put_model(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<PutModelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let model = ModelRef::parse(&request.model_ref)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    state
        .config_store
        .set_heartbeat_model(Some(&model))
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "ref": model.to_string() })))
}

pub(super) async fn clear_model(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .config_store
        .set_heartbeat_model(None)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "ref": null })))
}
