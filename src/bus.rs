//! # bus
//!
//! **Tick Store & Bus** — latest tick per instrument plus a broadcast topic.
//!
//! ```text
//!  publish(tick) ──▶ latest[token] = tick   (last write wins)
//!                └─▶ broadcast ring ──▶ subscriber A (own cursor)
//!                                   ──▶ subscriber B (own cursor)
//! ```
//!
//! `publish` never waits on a subscriber. Each subscriber reads the shared
//! ring through its own cursor; one that falls more than `capacity` ticks
//! behind loses the oldest ones and gets [`BusRecvError::Lagged`] once, after
//! which it should call [`TickBus::latest`] to recover the freshest state.
//! Late subscribers see no history.
//!
//! The store lock is held across the broadcast send, so store order and
//! delivery order are the same publish order for every subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::error::AppError;
use crate::models::Tick;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusRecvError {
    /// This subscriber fell behind; `n` oldest ticks were dropped for it.
    #[error("subscriber lagged, {0} ticks dropped")]
    Lagged(u64),
    #[error("tick bus closed")]
    Closed,
}

#[derive(Default)]
struct Store {
    by_token:  HashMap<u32, Arc<Tick>>,
    by_symbol: HashMap<String, u32>,
}

pub struct TickBus {
    store:           RwLock<Store>,
    tx:              broadcast::Sender<Arc<Tick>>,
    published:       AtomicU64,
    /// Unix millis of the last publish, 0 = never.
    last_publish_ms: AtomicI64,
}

impl TickBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            store: RwLock::new(Store::default()),
            tx,
            published: AtomicU64::new(0),
            last_publish_ms: AtomicI64::new(0),
        }
    }

    /// The single write path: replace the instrument's latest tick and fan it
    /// out to every current subscriber.
    pub async fn publish(&self, tick: Tick) -> Arc<Tick> {
        let tick = Arc::new(tick);
        {
            let mut store = self.store.write().await;
            store
                .by_symbol
                .insert(tick.symbol.clone(), tick.instrument_token);
            store.by_token.insert(tick.instrument_token, Arc::clone(&tick));

            // Err only means nobody is subscribed right now.
            let _ = self.tx.send(Arc::clone(&tick));
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        self.last_publish_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        tick
    }

    pub async fn latest(&self, token: u32) -> Result<Arc<Tick>, AppError> {
        let store = self.store.read().await;
        store
            .by_token
            .get(&token)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no tick yet for instrument {token}")))
    }

    pub async fn latest_by_symbol(&self, symbol: &str) -> Result<Arc<Tick>, AppError> {
        let store = self.store.read().await;
        store
            .by_symbol
            .get(symbol)
            .and_then(|token| store.by_token.get(token))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no tick yet for {symbol}")))
    }

    /// Every instrument's latest tick, ordered by token.
    pub async fn snapshot(&self) -> Vec<Arc<Tick>> {
        let store = self.store.read().await;
        let mut ticks: Vec<Arc<Tick>> = store.by_token.values().cloned().collect();
        ticks.sort_by_key(|t| t.instrument_token);
        ticks
    }

    pub fn subscribe(&self) -> TickSubscription {
        TickSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn last_publish_at(&self) -> Option<DateTime<Utc>> {
        match self.last_publish_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

/// One consumer's view of the broadcast topic.
pub struct TickSubscription {
    rx: broadcast::Receiver<Arc<Tick>>,
}

impl TickSubscription {
    pub async fn recv(&mut self) -> Result<Arc<Tick>, BusRecvError> {
        self.rx.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Lagged(n) => BusRecvError::Lagged(n),
            broadcast::error::RecvError::Closed => BusRecvError::Closed,
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
