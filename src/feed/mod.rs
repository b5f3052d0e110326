//! # feed
//!
//! Inbound side of the pipeline. Every source (upstream WebSocket, HTTP push,
//! simulator) is just "something that sends [`RawFrame`]s over time" into one
//! mpsc channel; the ingest loop normalizes and publishes them.

pub mod normalizer;
pub mod simulator;
pub mod upstream;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::TickBus;
use crate::models::SymbolMap;
use normalizer::{normalize, RawFrame};

#[derive(Debug, Default)]
pub struct FeedStats {
    pub frames_received: AtomicU64,
    pub frames_dropped:  AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FeedStatsSnapshot {
    pub frames_received: u64,
    pub frames_dropped:  u64,
}

impl FeedStats {
    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped:  self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Normalize one frame and publish it. Returns `false` if it was dropped.
pub async fn ingest_frame(
    raw:     &RawFrame,
    symbols: &SymbolMap,
    bus:     &TickBus,
    stats:   &FeedStats,
) -> bool {
    stats.frames_received.fetch_add(1, Ordering::Relaxed);

    match normalize(raw, symbols) {
        Ok(tick) => {
            debug!(symbol = %tick.symbol, ltp = tick.ltp, "tick normalized");
            bus.publish(tick).await;
            true
        }
        Err(err) => {
            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "⚠️ Dropping malformed feed frame");
            false
        }
    }
}

/// Long-running ingest task: drains every feed source into the bus.
pub async fn run_ingest(
    mut frames:   mpsc::Receiver<RawFrame>,
    bus:          Arc<TickBus>,
    symbols:      Arc<SymbolMap>,
    stats:        Arc<FeedStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("📥 Ingest loop started");
    loop {
        tokio::select! {
            maybe = frames.recv() => match maybe {
                Some(raw) => {
                    ingest_frame(&raw, &symbols, &bus, &stats).await;
                }
                None => break, // every source is gone
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("📥 Ingest loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use normalizer::QuoteFrame;

    fn frame(token: i32, ltp_paise: i32) -> RawFrame {
        RawFrame::Binary(
            QuoteFrame {
                token,
                ltp_paise,
                last_trade_time: 1_718_000_000,
                exchange_time: 1_718_000_000,
                ..QuoteFrame::default()
            }
            .encode(),
        )
    }

    #[tokio::test]
    async fn bad_frame_does_not_stop_ingestion() {
        let bus = TickBus::new(16);
        let symbols = SymbolMap::parse("408065:INFY");
        let stats = FeedStats::default();
        let mut sub = bus.subscribe();

        let frames = [
            frame(408065, 10_000),
            RawFrame::Binary(vec![1, 2, 3]),
            frame(0, 10_000),
            frame(408065, 10_300),
        ];
        for raw in &frames {
            ingest_frame(raw, &symbols, &bus, &stats).await;
        }

        assert_eq!(sub.recv().await.unwrap().ltp, 100.0);
        assert_eq!(sub.recv().await.unwrap().ltp, 103.0);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 4);
        assert_eq!(snap.frames_dropped, 2);
        assert_eq!(bus.latest(408065).await.unwrap().ltp, 103.0);
    }

    #[tokio::test]
    async fn ingest_loop_exits_on_shutdown() {
        let (_frames_tx, frames_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_ingest(
            frames_rx,
            Arc::new(TickBus::new(4)),
            Arc::new(SymbolMap::default()),
            Arc::new(FeedStats::default()),
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
