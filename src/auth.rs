//! # auth — API Key Middleware
//!
//! Guards every endpoint with the `X-API-Key` header.
//!
//! ## Mode
//! - `API_KEY` unset or empty → **allow all** (dev mode)
//! - `API_KEY` set → every request must carry `X-API-Key: <key>`
//!
//! ## Exempt
//! `/api/health`, so load balancers can probe without a key.
//!
//! WebSocket viewers that cannot set headers may pass `?api_key=<key>`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

pub const HEALTH_PATH: &str = "/api/health";

/// Axum middleware — checks `X-API-Key` against the configured key.
pub async fn require_api_key(
    State(api_key): State<Arc<str>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // ── Dev mode ──────────────────────────────────────────────────────────────
    if api_key.is_empty() {
        return next.run(request).await;
    }

    let path = request.uri().path();
    if path == HEALTH_PATH {
        return next.run(request).await;
    }

    let header = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok());
    let query = request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("api_key="))
    });

    if header.or(query) == Some(&*api_key) {
        next.run(request).await
    } else {
        warn!(path, "❌ Unauthorized request — invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
                "hint":  "Set X-API-Key header with your API key"
            })),
        )
            .into_response()
    }
}
