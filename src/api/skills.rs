use super::{ApiError, ApiState};
use crate::skills::SkillError;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use std::sync::Arc;

impl From<SkillError> for ApiError {
    fn from(error: SkillError) -> Self {
        match error {
            SkillError::InvalidName(_) => ApiError::bad_request(error.to_string()),
            SkillError::NotFound(_) => ApiError::not_found(error.to_string()),
            SkillError::AlreadyExists(_) => ApiError::bad_request(error.to_string()),
            SkillError::Io(_) => ApiError::internal(error.to_string()),
        }
    }
}

pub(super) async fn list(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "skills": state.skills.list() }))
}

pub(super) async fn get(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let content = state.skills.get(&name)?;
    Ok(Json(serde_json::json!({ "name": name, "content": content })))
}

#[derive(Deserialize)]
pub(super) struct CreateSkillRequest {
    name: String,
    content: String,
}

pub(super) async fn create(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateSkillRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.skills.create(&request.name, &request.content)?;
    Ok(Json(serde_json::json!({ "name": request.name })))
}

#[derive(Deserialize)]
pub(super) struct UpdateSkillRequest {
    content: String,
}

pub(super) async fn update(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(request): Json<UpdateSkillRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.skills.update(&name, &request.content)?;
    Ok(Json(serde_json::json!({ "name": name })))
}

pub(super) async fn remove(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.skills.delete(&name)?;
    Ok(Json(serde_json::json!({ "removed": name })))
}
