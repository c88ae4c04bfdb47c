use super::{ApiError, ApiState};

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct SearchQuery {
    q: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    20
}

/// Merged search: BM25 hits first, then grep-only contributions.
pub(super) async fn search(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::bad_request("query must not be empty"));
    }
    let limit = query.limit.clamp(1, 200);
    let results = state
        .archive
        .search_merged(&query.q, limit)
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "results": results })))
}

pub(super) async fn read(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = state
        .archive
        .read(id)
        .await
        .map_err(|error| ApiError::internal(error.to_string()))?
        .ok_or_else(|| ApiError::not_found(format!("no archive record {id}")))?;
    Ok(Json(serde_json::json!({ "record": record })))
}
