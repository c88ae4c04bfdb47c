//! The management surface: HTTP + WebSocket on a single port.
//!
//! Everything under `/api/` is JSON; any other route falls through to static
//! dashboard serving with an SPA fallback. The surface assumes localhost or
//! SSH-tunnelled access; there is no authentication on this surface.

mod archive;
mod cron;
mod heartbeat;
mod model;
mod sessions;
mod skills;
mod statics;
mod status;
mod world_model;
mod ws;

use crate::channel::ChannelHub;
use crate::config::GatewayConfig;
use crate::config_store::ConfigStore;
use crate::cron::CronService;
use crate::heartbeat::HeartbeatRunner;
use crate::llm::AgentRuntime;
use crate::restart::RestartManager;
use crate::session::{SessionLog, SessionRouter};
use crate::skills::SkillStore;
use crate::world_model::WorldModel;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Instant;
use tokio::sync::{broadcast, watch};

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Interval between `health` event broadcasts to WebSocket clients.
const HEALTH_BROADCAST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

pub struct ApiState {
    pub config: Arc<GatewayConfig>,
    pub config_store: Arc<ConfigStore>,
    pub runtime: Arc<dyn AgentRuntime>,
    pub session_log: Arc<SessionLog>,
    pub router: Arc<SessionRouter>,
    pub archive: Arc<crate::archive::Archive>,
    pub world_model: Arc<WorldModel>,
    pub cron: Arc<CronService>,
    pub heartbeat: Arc<HeartbeatRunner>,
    pub restart: Arc<RestartManager>,
    pub hub: Arc<ChannelHub>,
    pub skills: Arc<SkillStore>,
    pub started_at: Instant,
    pub ws_clients: AtomicUsize,
    /// Fire-and-forget server→client event frames.
    pub events: broadcast::Sender<serde_json::Value>,
}

impl ApiState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// A JSON error body with the right status code. Every handler error funnels
/// through this so clients always see `{"error": ...}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/health", get(status::health))
        .route("/api/status", get(status::status))
        .route("/api/config", get(status::config))
        .route(
            "/api/world-model",
            get(world_model::get_document).put(world_model::put_document),
        )
        .route("/api/heartbeat", get(heartbeat::get_config))
        .route(
            "/api/heartbeat/content",
            get(heartbeat::get_content).put(heartbeat::put_content),
        )
        .route("/api/heartbeat/runs", get(heartbeat::runs))
        .route(
            "/api/heartbeat/model",
            get(heartbeat::get_model)
                .put(heartbeat::put_model)
                .delete(heartbeat::clear_model),
        )
        .route("/api/cron", get(cron::list).post(cron::create))
        .route("/api/cron/{id}", delete(cron::remove))
        .route("/api/cron/{id}/enabled", post(cron::set_enabled))
        .route("/api/cron/{id}/trigger", post(cron::trigger))
        .route("/api/cron/{id}/runs", get(cron::runs))
        .route("/api/sessions", get(sessions::list))
        .route("/api/sessions/read", get(sessions::read))
        .route("/api/archive/search", get(archive::search))
        .route("/api/archive/{id}", get(archive::read))
        .route("/api/model", get(model::get_current).put(model::set_current))
        .route(
            "/api/model/aliases",
            get(model::list_aliases).post(model::set_alias),
        )
        .route("/api/model/aliases/{name}", delete(model::remove_alias))
        .route(
            "/api/model/fallbacks",
            get(model::get_fallbacks)
                .put(model::set_fallbacks)
                .delete(model::clear_fallbacks),
        )
        .route("/api/skills", get(skills::list).post(skills::create))
        .route(
            "/api/skills/{name}",
            get(skills::get).put(skills::update).delete(skills::remove),
        )
        .route("/ws", get(ws::upgrade))
        .fallback(statics::serve)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}


/// Bind and serve until shutdown. Failing to bind is fatal; the caller
/// aborts startup.
pub async fn serve(
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<std::net::SocketAddr> {
    let address = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind management API on {address}: {error}"))?;
    let bound = listener.local_addr()?;
    tracing::info!(%bound, "management API listening");

    tokio::spawn(ws::health_broadcast(state.clone(), shutdown.clone()));

    let app = router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(error) = result {
            tracing::error!(%error, "management API server failed");
        }
    });

    Ok(bound)
}
