use super::{ApiError, ApiState};
use crate::cron::{CronJob, ScheduleType};
use crate::error::CronError;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::sync::Arc;

impl From<CronError> for ApiError {
    fn from(error: CronError) -> Self {
        match error {
            CronError::JobNotFound(_) => ApiError::not_found(error.to_string()),
            CronError::InvalidSchedule { .. } => ApiError::bad_request(error.to_string()),
            CronError::Persist(_) => ApiError::internal(error.to_string()),
        }
    }
}

pub(super) async fn list(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "jobs": state.cron.list_jobs() }))
}

#[derive(Deserialize)]
pub(super) struct CreateJobRequest {
    name: String,
    schedule_type: ScheduleType,
    schedule: String,
    prompt: String,
    #[serde(default)]
    delivery: Option<String>,
}

pub(super) async fn create(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<CronJob>, ApiError> {
    if request.name.trim().is_empty() || request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("name and prompt are required"));
    }
    let job = state.cron.add_job(
        &request.name,
        request.schedule_type,
        &request.schedule,
        &request.prompt,
        request.delivery,
    )?;
    tracing::info!(job_id = %job.id, name = %job.name, "cron job created via API");
    Ok(Json(job))
}

pub(super) async fn remove(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.cron.remove_job(&id)?;
    Ok(Json(serde_json::json!({ "removed": removed.id })))
}

#[derive(Deserialize)]
pub(super) struct SetEnabledRequest {
    enabled: bool,
}

pub(super) async fn set_enabled(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<SetEnabledRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cron.set_enabled(&id, request.enabled)?;
    Ok(Json(serde_json::json!({ "id": id, "enabled": request.enabled })))
}

pub(super) async fn trigger(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state.cron.trigger_job(&id).await?;
    Ok(Json(serde_json::json!({ "run": run })))
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
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.cron.get_job(&id).is_none() {
        return Err(ApiError::not_found(format!("no cron job {id}")));
    }
    let runs = state.cron.read_runs(&id, query.offset, query.limit.min(200));
    Ok(Json(serde_json::json!({ "runs": runs })))
}
