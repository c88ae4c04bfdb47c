use super::ApiState;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    pub status: &'static str,
    pub uptime: u64,
    pub clients: usize,
    pub sessions: usize,
    pub timestamp: i64,
}

pub(super) fn health_snapshot(state: &ApiState) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime: state.uptime_seconds(),
        clients: state.ws_clients.load(Ordering::Relaxed),
        sessions: state.session_log.list().len(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}

pub(super) async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(health_snapshot(&state))
}

/// Aggregate snapshot for dashboards.
pub(super) async fn status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let runtime_state = state.runtime.state().await;
    let channels = state.hub.health_all().await;
    let jobs = state.cron.list_jobs();

    Json(serde_json::json!({
        "health": health_snapshot(&state),
        "model": {
            "current": state.config_store.current_model().to_string(),
            "runtime": runtime_state.model.to_string(),
            "thinking_level": state.config_store.thinking_level().as_str(),
            "fallbacks": state
                .config_store
                .fallback_chain()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            "heartbeat_override": state
                .config_store
                .heartbeat_model()
                .map(|m| m.to_string()),
        },
        "cron": {
            "jobs": jobs.len(),
            "enabled": jobs.iter().filter(|j| j.enabled).count(),
        },
        "channels": channels,
        "restart_pending": state.restart.sentinel_exists(),
    }))
}

/// Static configuration with secrets masked.
pub(super) async fn config(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(state.config.masked_summary())
}
