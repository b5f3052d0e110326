//! # routes::feed
//!
//! HTTP push sources for the normalizer. Frames are validated up front so
//! the pusher gets a 422 for garbage, then queued onto the same ingest
//! channel the upstream WebSocket client feeds.
//!
//! | Method | Path              | Body                                              |
//! |--------|-------------------|---------------------------------------------------|
//! | POST   | `/api/feed/frame` | binary quote packet (or envelope, see below)      |
//! | POST   | `/api/feed/tick`  | vendor tick JSON object or array                  |
//!
//! With `X-Frame-Envelope: true` the binary body is a multi-packet envelope
//! and is split before validation.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::AppError;
use crate::feed::normalizer::{normalize, split_packets, RawFrame, VendorTick};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum VendorPayload {
    One(VendorTick),
    Many(Vec<VendorTick>),
}

fn is_envelope(headers: &HeaderMap) -> bool {
    headers
        .get("X-Frame-Envelope")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

async fn enqueue(state: &SharedState, frames: Vec<RawFrame>) -> Result<usize, AppError> {
    // Reject the whole batch before queueing any of it.
    for raw in &frames {
        normalize(raw, &state.symbols)?;
    }

    let count = frames.len();
    for raw in frames {
        state
            .frames
            .send(raw)
            .await
            .map_err(|_| AppError::UpstreamUnavailable("ingest loop is not running".into()))?;
    }
    Ok(count)
}

// ─── POST /api/feed/frame ─────────────────────────────────────────────────────

pub async fn push_frame(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let frames: Vec<RawFrame> = if is_envelope(&headers) {
        split_packets(&body)?
            .into_iter()
            .map(|packet| RawFrame::Binary(packet.to_vec()))
            .collect()
    } else {
        vec![RawFrame::Binary(body.to_vec())]
    };

    let accepted = enqueue(&state, frames).await?;
    debug!(accepted, "binary frames queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true, "accepted": accepted }))))
}

// ─── POST /api/feed/tick ──────────────────────────────────────────────────────

pub async fn push_ticks(
    State(state): State<SharedState>,
    Json(payload): Json<VendorPayload>,
) -> Result<impl IntoResponse, AppError> {
    let ticks = match payload {
        VendorPayload::One(tick) => vec![tick],
        VendorPayload::Many(ticks) => ticks,
    };
    if ticks.is_empty() {
        return Err(AppError::BadRequest("no ticks in payload".into()));
    }

    let accepted = enqueue(&state, ticks.into_iter().map(RawFrame::Vendor).collect()).await?;
    debug!(accepted, "vendor ticks queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true, "accepted": accepted }))))
}
