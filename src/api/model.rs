use super::{ApiError, ApiState};
use crate::llm::ModelRef;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use std::sync::Arc;

pub(super) async fn get_current(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "model": state.config_store.current_model().to_string(),
        "thinking_level": state.config_store.thinking_level().as_str(),
    }))
}

#[derive(Deserialize)]
pub(super) struct SetModelRequest {
    model: String,
}

pub(super) async fn set_current(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SetModelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let model = state
        .config_store
        .resolve_model(&request.model)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    state.runtime.set_model(model.clone()).await;
    state.config_store.set_current_model(model.clone());
    tracing::info!(model = %model, "model switched via API");
    Ok(Json(serde_json::json!({ "model": model.to_string() })))
}

pub(super) async fn list_aliases(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "aliases": state.config_store.aliases() }))
}

#[derive(Deserialize)]
pub(super) struct SetAliasRequest {
    name: String,
    model: String,
}

pub(super) async fn set_alias(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SetAliasRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("alias name must not be empty"));
    }
    let model = ModelRef::parse(&request.model)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    state
        .config_store
        .set_alias(&request.name, &model)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({
        "name": request.name.to_lowercase(),
        "model": model.to_string(),
    })))
}

pub(super) async fn remove_alias(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let existed = state
        .config_store
        .remove_alias(&name)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    if !existed {
        return Err(ApiError::not_found(format!("no alias named {name:?}")));
    }
    Ok(Json(serde_json::json!({ "removed": name.to_lowercase() })))
}

pub(super) async fn get_fallbacks(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let chain: Vec<String> = state
        .config_store
        .fallback_chain()
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(serde_json::json!({ "fallbacks": chain }))
}

#[derive(Deserialize)]
pub(super) struct SetFallbacksRequest {
    fallbacks: Vec<String>,
}

pub(super) async fn set_fallbacks(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<SetFallbacksRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut chain = Vec::with_capacity(request.fallbacks.len());
    for entry in &request.fallbacks {
        chain.push(
            ModelRef::parse(entry).map_err(|error| ApiError::bad_request(error.to_string()))?,
        );
    }
    state
        .config_store
        .set_fallback_chain(&chain)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "fallbacks": request.fallbacks })))
}

pub(super) async fn clear_fallbacks(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .config_store
        .clear_fallback_chain()
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "fallbacks": [] })))
}
