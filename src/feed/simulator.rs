//! # feed::simulator
//!
//! Paper feed for development: emits one binary quote packet per configured
//! token every interval, with a small random walk on the price and a
//! ten-level depth ladder around it. Runs through the exact same
//! normalizer path as the real upstream.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::info;

use super::normalizer::{QuoteFrame, RawFrame, WireDepthLevel};

const DEPTH_LEVELS: i32 = 5;

/// Random-walk state for one instrument, in paise.
#[derive(Debug, Clone)]
struct Walk {
    open:  i32,
    high:  i32,
    low:   i32,
    price: i32,
}

impl Walk {
    fn new(price: i32) -> Self {
        Self { open: price, high: price, low: price, price }
    }

    /// Moves the price by at most ±`max_step` basis points, floored at 1 rupee.
    fn step(&mut self, rng: &mut impl Rng, max_step: i32) {
        let bps = rng.gen_range(-max_step..=max_step);
        let delta = i64::from(self.price) * i64::from(bps) / 10_000;
        self.price = (i64::from(self.price) + delta).clamp(100, i64::from(i32::MAX)) as i32;
        self.high = self.high.max(self.price);
        self.low = self.low.min(self.price);
    }
}

fn quote(token: u32, walk: &Walk, rng: &mut impl Rng) -> QuoteFrame {
    let now = Utc::now().timestamp() as i32;
    let tick_size = 5; // 0.05 rupee

    let mut depth = Vec::with_capacity(2 * DEPTH_LEVELS as usize);
    for side in [-1, 1] {
        for level in 1..=DEPTH_LEVELS {
            depth.push(WireDepthLevel {
                quantity:    rng.gen_range(1..=50),
                price_paise: walk.price + side * level * tick_size,
                orders:      rng.gen_range(1..=5),
            });
        }
    }

    QuoteFrame {
        token:           token as i32,
        ltp_paise:       walk.price,
        last_quantity:   rng.gen_range(1..=100),
        average_paise:   (walk.high + walk.low) / 2,
        volume:          rng.gen_range(1_000..=10_000),
        buy_quantity:    rng.gen_range(100..=500),
        sell_quantity:   rng.gen_range(100..=500),
        open_paise:      walk.open,
        high_paise:      walk.high,
        low_paise:       walk.low,
        close_paise:     walk.open,
        last_trade_time: now - 2,
        oi:              rng.gen_range(100..=1_000),
        oi_day_high:     rng.gen_range(100..=1_000),
        oi_day_low:      rng.gen_range(100..=1_000),
        exchange_time:   now,
        depth,
    }
}

pub async fn run_simulator(
    tokens:       Vec<u32>,
    frames:       mpsc::Sender<RawFrame>,
    interval:     Duration,
    max_step_bps: i32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut walks: HashMap<u32, Walk> = {
        let mut rng = rand::thread_rng();
        tokens
            .iter()
            .map(|&token| (token, Walk::new(rng.gen_range(10_000..=15_000))))
            .collect()
    };
    let mut ticker = tokio::time::interval(interval);
    info!(tokens = tokens.len(), ?interval, "🎭 Simulated feed started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        // ThreadRng is !Send: build every frame before the first await.
        let batch: Vec<Vec<u8>> = {
            let mut rng = rand::thread_rng();
            tokens
                .iter()
                .filter_map(|token| {
                    let walk = walks.get_mut(token)?;
                    walk.step(&mut rng, max_step_bps);
                    Some(quote(*token, walk, &mut rng).encode())
                })
                .collect()
        };

        for bytes in batch {
            tokio::select! {
                sent = frames.send(RawFrame::Binary(bytes)) => {
                    if sent.is_err() {
                        info!("🎭 Ingest channel closed — simulator stopping");
                        return;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }

    info!("🎭 Simulated feed stopped");
}
