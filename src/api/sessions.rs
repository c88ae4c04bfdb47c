use super::{ApiError, ApiState};
use crate::session::SessionKey;

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct SessionEntry {
    key: String,
    agent: String,
    channel: String,
    target: String,
    message_count: usize,
    last_activity: i64,
}

#[derive(Serialize)]
pub(super) struct SessionsResponse {
    sessions: Vec<SessionEntry>,
}

pub(super) async fn list(State(state): State<Arc<ApiState>>) -> Json<SessionsResponse> {
    let sessions = state
        .session_log
        .list()
        .into_iter()
        .map(|info| SessionEntry {
            key: info.key,
            agent: info.parsed.agent.clone(),
            channel: info.parsed.channel.clone(),
            target: info.parsed.target.clone(),
            message_count: info.message_count,
            last_activity: info.last_activity,
        })
        .collect();
    Json(SessionsResponse { sessions })
}

#[derive(Deserialize)]
pub(super) struct ReadQuery {
    key: String,
}

pub(super) async fn read(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = SessionKey::parse(&query.key)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;
    if !state.session_log.exists(&key) {
        return Err(ApiError::not_found(format!("no session {}", query.key)));
    }
    let turns = state
        .session_log
        .read(&key)
        .map_err(|error| ApiError::internal(error.to_string()))?;
    Ok(Json(serde_json::json!({ "key": query.key, "turns": turns })))
}
