//! # routes::spike
//!
//! Operator hook for re-arming spike latches. The reactor owns the latches,
//! so this only queues a command; it does not wait for it to apply.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::engine::spike::SpikeCommand;
use crate::error::AppError;
use crate::state::SharedState;

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    /// Omitted → reset every symbol.
    pub symbol: Option<String>,
}

/// POST /api/spike/reset — `{"symbol":"INFY"}` or `{}`.
pub async fn reset_spike(
    State(state): State<SharedState>,
    Json(request): Json<ResetRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (command, target) = match request.symbol.map(|s| s.trim().to_string()) {
        Some(symbol) if symbol.is_empty() => {
            return Err(AppError::BadRequest("symbol must not be empty".into()));
        }
        Some(symbol) => (SpikeCommand::Reset { symbol: symbol.clone() }, symbol),
        None => (SpikeCommand::ResetAll, "ALL".to_string()),
    };

    state
        .spike_commands
        .send(command)
        .await
        .map_err(|_| AppError::UpstreamUnavailable("spike reactor is not running".into()))?;

    info!(symbol = %target, "🔄 Spike reset requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true, "reset": target }))))
}
