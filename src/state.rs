//! # state
//!
//! Shared handles injected into every Axum handler.
//!
//! Everything here is either immutable after startup or a channel / store
//! that synchronizes itself; handlers never take a lock on `AppState`.
//! Spike state is deliberately absent: it lives inside the spike reactor
//! task and is reached only through `spike_commands`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::bus::TickBus;
use crate::engine::spike::SpikeCommand;
use crate::fanout::{ConnectionHub, FeedHealth};
use crate::feed::normalizer::RawFrame;
use crate::feed::FeedStats;
use crate::models::SymbolMap;
use crate::store::Stores;

#[derive(Clone)]
pub struct AppState {
    pub bus:     Arc<TickBus>,
    pub symbols: Arc<SymbolMap>,

    // ── Feed ──────────────────────────────────────────────────────────────────
    /// HTTP push sources share the ingest channel with the upstream client.
    pub frames:      mpsc::Sender<RawFrame>,
    pub feed_stats:  Arc<FeedStats>,
    pub feed_health: Arc<FeedHealth>,

    // ── Fan-out ───────────────────────────────────────────────────────────────
    pub tick_hub:  Arc<ConnectionHub>,
    pub order_hub: Arc<ConnectionHub>,

    // ── Reactors / collaborators ──────────────────────────────────────────────
    pub spike_commands: mpsc::Sender<SpikeCommand>,
    pub stores:         Stores,

    /// Flipped to `true` once; WebSocket sessions close when they see it.
    pub shutdown:   watch::Receiver<bool>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;
