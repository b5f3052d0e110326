//! # routes::ticks
//!
//! Latest-value reads straight from the tick store. No history: a symbol
//! that has never ticked is a 404, not an empty body.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::AppError;
use crate::models::Tick;
use crate::state::SharedState;

/// GET /api/ticks/:symbol — `symbol` may also be a numeric instrument token.
pub async fn get_tick(
    State(state): State<SharedState>,
    Path(symbol): Path<String>,
) -> Result<Json<Tick>, AppError> {
    let tick = match state.bus.latest_by_symbol(&symbol).await {
        Ok(tick) => tick,
        Err(not_found) => match symbol.parse::<u32>() {
            Ok(token) => state.bus.latest(token).await?,
            Err(_) => return Err(not_found),
        },
    };
    Ok(Json(Tick::clone(&tick)))
}

/// GET /api/ticks — every instrument's latest tick, keyed by symbol.
pub async fn all_ticks(State(state): State<SharedState>) -> Json<BTreeMap<String, Tick>> {
    let ticks = state
        .bus
        .snapshot()
        .await
        .into_iter()
        .map(|tick| (tick.symbol.clone(), Tick::clone(&tick)))
        .collect();
    Json(ticks)
}
