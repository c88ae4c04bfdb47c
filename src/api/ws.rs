//! WebSocket protocol: request/response frames plus fire-and-forget events.
//!
//! Frames are JSON. Client → server: `{type:"req", id, method, params?}`.
//! Server → client: `{type:"res", id, ok, payload?|error?}` and
//! `{type:"event", event, payload?}`. A `health` event goes to every
//! connected client on a fixed interval.

use super::{ApiState, status};
use crate::restart::RestartSentinel;
use crate::session::SessionKey;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::watch;

#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(rename = "type")]
    frame_type: String,
    id: serde_json::Value,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

pub(super) async fn upgrade(
    State(state): State<Arc<ApiState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<ApiState>, mut socket: WebSocket) {
    state.ws_clients.fetch_add(1, Ordering::Relaxed);
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(message)) = inbound else { break };
                let Message::Text(text) = message else { continue };
                let response = handle_frame(&state, text.as_str()).await;
                if socket
                    .send(Message::Text(response.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            event = events.recv() => {
                let Ok(event) = event else { continue };
                if socket
                    .send(Message::Text(event.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    state.ws_clients.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
pub(super) async fn handle_frame_for_tests(
    state: &Arc<ApiState>,
    raw: &str,
) -> serde_json::Value {
    handle_frame(state, raw).await
}

async fn handle_frame(state: &Arc<ApiState>, raw: &str) -> serde_json::Value {
    let frame: RequestFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(error) => {
            return json!({
                "type": "res", "id": null, "ok": false,
                "error": format!("malformed frame: {error}"),
            });
        }
    };
    if frame.frame_type != "req" {
        return json!({
            "type": "res", "id": frame.id, "ok": false,
            "error": format!("unexpected frame type: {}", frame.frame_type),
        });
    }

    match dispatch(state, &frame.method, &frame.params).await {
        Ok(payload) => json!({ "type": "res", "id": frame.id, "ok": true, "payload": payload }),
        Err(error) => json!({ "type": "res", "id": frame.id, "ok": false, "error": error }),
    }
}

async fn dispatch(
    state: &Arc<ApiState>,
    method: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    match method {
        "health" => Ok(serde_json::to_value(status::health_snapshot(state))
            .unwrap_or_else(|_| json!({}))),
        "sessions.list" => {
            let sessions: Vec<serde_json::Value> = state
                .session_log
                .list()
                .into_iter()
                .map(|info| {
                    json!({
                        "key": info.key,
                        "message_count": info.message_count,
                        "last_activity": info.last_activity,
                    })
                })
                .collect();
            Ok(json!({ "sessions": sessions }))
        }
        "sessions.read" => {
            let raw_key = params
                .get("key")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "missing param: key".to_string())?;
            let key = SessionKey::parse(raw_key).map_err(|error| error.to_string())?;
            let turns = state
                .session_log
                .read(&key)
                .map_err(|error| error.to_string())?;
            Ok(json!({ "key": raw_key, "turns": turns }))
        }
        "restart" => {
            let reason = params
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("management api")
                .to_string();
            let restart = state.restart.clone();
            // The supervisor call is blocking process spawn work.
            let result = tokio::task::spawn_blocking(move || {
                restart.trigger_restart(&RestartSentinel::new(reason))
            })
            .await
            .map_err(|error| error.to_string())?;
            result.map_err(|error| error.to_string())?;
            Ok(json!({ "restarting": true }))
        }
        other => Err(format!("Unknown method: {other}")),
    }
}

/// Broadcast a `health` event to all connected clients on a fixed interval.
pub(super) async fn health_broadcast(state: Arc<ApiState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + super::HEALTH_BROADCAST_INTERVAL,
        super::HEALTH_BROADCAST_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let payload = serde_json::to_value(status::health_snapshot(&state))
                    .unwrap_or_else(|_| json!({}));
                let frame = json!({ "type": "event", "event": "health", "payload": payload });
                // No receivers is fine; send only fails when nobody listens.
                let _ = state.events.send(frame);
            }
            _ = shutdown.wait_for(|stop| *stop) => return,
        }
    }
}
