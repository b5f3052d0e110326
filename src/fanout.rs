//! # fanout — Live Client Fan-out
//!
//! A [`ConnectionHub`] owns the set of connected WebSocket viewers, each with
//! its own bounded outbound queue. Broadcasting snapshots the set, then
//! `try_send`s to every queue: a full queue drops that message for that
//! client only, a closed queue is pruned after the pass. A slow or dead
//! client never stalls the others. Once a lagging client's queue drains it
//! receives `{"event":"GAP","dropped":n}` and should re-read
//! `GET /api/ticks` for current state.
//!
//! Forwarders bridge the internal topics onto hubs:
//! - [`forward_ticks`]: tick bus → `/ws/ticks` (full Tick JSON)
//! - [`forward_orders`]: order events → `/ws/orders`
//! - [`run_feed_watchdog`]: `FEED_UNAVAILABLE` / `FEED_RESTORED` on `/ws/ticks`

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusRecvError, TickBus};
use crate::events::LiveEvent;
use crate::models::Tick;

pub type ConnectionId = Uuid;

// ─── Connection Hub ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct Client {
    tx:     mpsc::Sender<Arc<str>>,
    /// Messages dropped since the last `GAP` notice reached this client.
    missed: Arc<AtomicU64>,
}

pub struct ConnectionHub {
    name:        &'static str,
    capacity:    usize,
    connections: RwLock<HashMap<ConnectionId, Client>>,
    dropped:     AtomicU64,
}

impl ConnectionHub {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            connections: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub async fn register(&self) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.capacity);
        let client = Client {
            tx,
            missed: Arc::new(AtomicU64::new(0)),
        };
        self.connections.write().await.insert(id, client);
        debug!(hub = self.name, %id, "client registered");
        (id, rx)
    }

    pub async fn unregister(&self, id: ConnectionId) {
        if self.connections.write().await.remove(&id).is_some() {
            debug!(hub = self.name, %id, "client unregistered");
        }
    }

    /// Delivers `message` to every live connection; returns how many
    /// queues accepted it.
    ///
    /// A client that lost messages gets a `GAP` notice ahead of its next
    /// delivered message, once its queue has room again.
    pub async fn broadcast(&self, message: Arc<str>) -> usize {
        let targets: Vec<(ConnectionId, Client)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, client) in targets {
            let missed = client.missed.load(Ordering::Relaxed);
            if missed > 0 {
                let notice: Arc<str> = LiveEvent::Gap { dropped: missed }.to_json().into();
                match client.tx.try_send(notice) {
                    Ok(()) => {
                        client.missed.fetch_sub(missed, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.drop_for(id, &client);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(id);
                        continue;
                    }
                }
            }

            match client.tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => self.drop_for(id, &client),
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in &closed {
                connections.remove(id);
            }
            debug!(hub = self.name, pruned = closed.len(), "closed clients pruned");
        }
        delivered
    }

    fn drop_for(&self, id: ConnectionId, client: &Client) {
        client.missed.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(hub = self.name, %id, "client queue full — message dropped");
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn tick_json(tick: &Tick) -> Arc<str> {
    serde_json::to_string(tick)
        .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
        .into()
}

// ─── Forwarders ───────────────────────────────────────────────────────────────

/// Bus → tick hub. On lag, re-sends the latest value of every instrument so
/// viewers converge on current prices.
pub async fn forward_ticks(bus: Arc<TickBus>, hub: Arc<ConnectionHub>, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = bus.subscribe();
    info!("📡 Tick fan-out started");

    loop {
        tokio::select! {
            received = ticks.recv() => match received {
                Ok(tick) => {
                    hub.broadcast(tick_json(&tick)).await;
                }
                Err(BusRecvError::Lagged(skipped)) => {
                    warn!(skipped, "⚠️ Tick fan-out lagged — resending latest snapshot");
                    for tick in bus.snapshot().await {
                        hub.broadcast(tick_json(&tick)).await;
                    }
                }
                Err(BusRecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("📡 Tick fan-out stopped");
}

/// Order-event topic → order hub.
pub async fn forward_orders(
    mut events:   broadcast::Receiver<Arc<str>>,
    hub:          Arc<ConnectionHub>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("📡 Order fan-out started");

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(json) => {
                    hub.broadcast(json).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "⚠️ Order fan-out lagged — events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("📡 Order fan-out stopped");
}

// ─── Feed Staleness ───────────────────────────────────────────────────────────

/// Edge-triggered staleness flag shared with `/api/health` and new viewers.
#[derive(Debug)]
pub struct FeedHealth {
    stale:       AtomicBool,
    stale_after: Duration,
}

impl FeedHealth {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale: AtomicBool::new(false),
            stale_after,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Relaxed)
    }

    /// Current outage state for a viewer joining now; `None` while healthy.
    pub fn notice(&self, last_tick_at: Option<DateTime<Utc>>) -> Option<LiveEvent> {
        self.is_stale().then(|| LiveEvent::FeedUnavailable {
            last_tick_at,
            stale_secs: self.stale_after.as_secs(),
        })
    }

    /// Returns an event only on a state change. Before the first tick,
    /// staleness is measured from `since` (process start).
    pub fn evaluate(
        &self,
        last_tick_at: Option<DateTime<Utc>>,
        since:        DateTime<Utc>,
        now:          DateTime<Utc>,
    ) -> Option<LiveEvent> {
        let reference = last_tick_at.unwrap_or(since);
        let age = (now - reference).to_std().unwrap_or_default();
        let stale = age >= self.stale_after;

        let was_stale = self.stale.swap(stale, Ordering::Relaxed);
        match (was_stale, stale, last_tick_at) {
            (false, true, _) => Some(LiveEvent::FeedUnavailable {
                last_tick_at,
                stale_secs: self.stale_after.as_secs(),
            }),
            (true, false, Some(at)) => Some(LiveEvent::FeedRestored { last_tick_at: at }),
            _ => None,
        }
    }
}

pub async fn run_feed_watchdog(
    bus:          Arc<TickBus>,
    hub:          Arc<ConnectionHub>,
    health:       Arc<FeedHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let started = Utc::now();
    let stale_after = health.stale_after;
    let period = (stale_after / 4).max(Duration::from_millis(250));
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if let Some(event) = health.evaluate(bus.last_publish_at(), started, Utc::now()) {
            match &event {
                LiveEvent::FeedUnavailable { .. } => warn!(?stale_after, "📉 Feed unavailable — no ticks"),
                LiveEvent::FeedRestored { .. } => info!("📈 Feed restored"),
                LiveEvent::Gap { .. } => {}
            }
            hub.broadcast(event.to_json().into()).await;
        }
    }
}
