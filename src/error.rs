//! # error
//!
//! Centralised application error type.
//!
//! Handlers return `Result<_, AppError>` and reactors use the same type for
//! collaborator calls. Axum's `IntoResponse` impl converts these into
//! structured JSON error bodies so dashboards always get a machine-readable
//! response even on failure.
//!
//! | Variant               | Policy                                              |
//! |-----------------------|-----------------------------------------------------|
//! | `Decode`              | drop the frame, keep ingesting                      |
//! | `NotFound`            | absence, not failure                                |
//! | `UpstreamUnavailable` | reconnect with bounded backoff, no replay           |
//! | `BrokerCallFailed`    | terminal for that single attempt, audited           |
//! | `ConfigUnavailable`   | hold last-known configuration                       |

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::feed::normalizer::DecodeError;

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No value yet (e.g. no tick published for an instrument).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A raw feed frame could not be normalized.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Feed, bus or store connection lost.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Broker order placement or query failed.
    #[error("Broker call failed: {0}")]
    BrokerCallFailed(String),

    /// Settings store unreachable or not configured.
    #[error("Configuration unavailable: {0}")]
    ConfigUnavailable(String),

    /// Persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Store(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Decode(err) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
            AppError::UpstreamUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::BrokerCallFailed(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::ConfigUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Store(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
