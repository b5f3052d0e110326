//! # routes::monitor
//!
//! **Monitor Loop**: live push streams and read-only dashboards.
//!
//! ## Endpoints
//!
//! | Method    | Path             | Description                                  |
//! |-----------|------------------|----------------------------------------------|
//! | GET (WS)  | `/ws/ticks`      | every published tick + feed health notices   |
//! | GET (WS)  | `/ws/orders`     | order-lifecycle events                       |
//! | GET       | `/api/health`    | counters, feed staleness (no auth)           |
//! | GET       | `/api/positions` | mirrored broker positions                    |
//! | GET       | `/api/audit`     | most recent audit records                    |
//!
//! Streams are push-only and start from "now": nothing is replayed on join.
//! The one exception is current state: joining `/ws/ticks` during a feed
//! outage yields `FEED_UNAVAILABLE` first.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use crate::error::AppError;
use crate::fanout::ConnectionHub;
use crate::state::SharedState;

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 500;

// ─── WebSocket Handlers ───────────────────────────────────────────────────────

/// A viewer joining mid-outage is told so first; ticks follow once the feed
/// is back.
pub async fn ws_ticks(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let hub = state.tick_hub.clone();
    let shutdown = state.shutdown.clone();
    let health = state.feed_health.clone();
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| async move {
        let greeting: Option<Arc<str>> = health
            .notice(bus.last_publish_at())
            .map(|event| event.to_json().into());
        handle_socket(socket, hub, greeting, shutdown).await
    })
}

pub async fn ws_orders(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let hub = state.order_hub.clone();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, None, shutdown))
}

async fn handle_socket(
    socket:       WebSocket,
    hub:          Arc<ConnectionHub>,
    greeting:     Option<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (id, mut outbound) = hub.register().await;
    let (mut sender, mut receiver) = socket.split();

    let clients = hub.len().await;
    info!(%id, clients, "🔌 WebSocket client connected");

    if let Some(greeting) = greeting {
        if sender.send(Message::Text(greeting.to_string())).await.is_err() {
            hub.unregister(id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            // Hub queue → client
            message = outbound.recv() => match message {
                Some(json) => {
                    if sender.send(Message::Text(json.to_string())).await.is_err() {
                        break; // client went away
                    }
                }
                None => break,
            },

            // Client → us (Ping / Close only)
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    let _ = sender.send(Message::Pong(data)).await;
                }
                _ => {} // Text/Binary from clients is ignored
            },

            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    hub.unregister(id).await;
    info!(%id, "🔌 WebSocket client disconnected");
}

// ─── REST Monitoring Endpoints ────────────────────────────────────────────────

/// GET /api/health
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let feed = state.feed_stats.snapshot();
    let stale = state.feed_health.is_stale();
    let instruments = state.bus.snapshot().await.len();
    let tick_clients = state.tick_hub.len().await;
    let order_clients = state.order_hub.len().await;

    Json(json!({
        "ok":              true,
        "status":          if stale { "degraded" } else { "ok" },
        "uptime_secs":     (Utc::now() - state.started_at).num_seconds(),
        "feed": {
            "stale":           stale,
            "last_tick_at":    state.bus.last_publish_at(),
            "frames_received": feed.frames_received,
            "frames_dropped":  feed.frames_dropped,
        },
        "bus": {
            "published":   state.bus.published_count(),
            "instruments": instruments,
            "subscribers": state.bus.subscriber_count(),
        },
        "clients": {
            "ticks":   tick_clients,
            "orders":  order_clients,
            "dropped": state.tick_hub.dropped_count() + state.order_hub.dropped_count(),
        },
    }))
}

/// GET /api/positions
pub async fn get_positions(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let positions = state.stores.positions.list().await?;
    Ok(Json(json!({
        "ok":        true,
        "count":     positions.len(),
        "positions": positions,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
}

/// GET /api/audit?limit=N — newest first.
pub async fn get_audit(
    State(state): State<SharedState>,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT).clamp(1, MAX_AUDIT_LIMIT);
    let records = state.stores.audit.recent(limit).await?;
    Ok(Json(json!({
        "ok":      true,
        "count":   records.len(),
        "records": records,
    })))
}
