//! Static dashboard serving with SPA fallback.
//!
//! Any route that isn't `/api/...` or `/ws` lands here. Path traversal is
//! rejected before any filesystem resolution; a missing file falls back to
//! `index.html` so client-side routing works.

use super::{ApiError, ApiState};

use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use std::path::Component;
use std::sync::Arc;

pub(super) async fn serve(
    State(state): State<Arc<ApiState>>,
    uri: Uri,
) -> Result<Response, ApiError> {
    let request_path = uri.path().trim_start_matches('/');

    // Only non-API routes fall through to static serving.
    if request_path == "api" || request_path.starts_with("api/") {
        return Err(ApiError::not_found("unknown API route"));
    }

    // Reject traversal before touching the filesystem.
    let relative = std::path::Path::new(request_path);
    if relative
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::forbidden("path traversal rejected"));
    }

    let static_dir = &state.config.static_dir;
    let candidate = if request_path.is_empty() {
        static_dir.join("index.html")
    } else {
        static_dir.join(relative)
    };

    match tokio::fs::read(&candidate).await {
        Ok(bytes) => Ok(file_response(&candidate, bytes)),
        Err(_) => {
            // SPA fallback: unknown paths get the app shell.
            let index = static_dir.join("index.html");
            match tokio::fs::read(&index).await {
                Ok(bytes) => Ok(file_response(&index, bytes)),
                Err(_) => Err(ApiError::not_found("not found")),
            }
        }
    }
}

fn file_response(path: &std::path::Path, bytes: Vec<u8>) -> Response {
    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response()
}
