//! # tickwire — Live Tick Fan-out & Trading Reactors
//!
//! ## Architecture Overview
//!
//! ```text
//!  ┌──────────────┐  binary / JSON frames   ┌────────────┐   publish   ┌──────────────┐
//!  │ Upstream WS  │ ───────────────────────▶│  Ingest    │ ──────────▶ │   TickBus    │
//!  │ HTTP push    │      mpsc<RawFrame>     │ Normalizer │             │ store + topic│
//!  │ Simulator    │                         └────────────┘             └──────┬───────┘
//!  └──────────────┘                                                           │
//!            ┌───────────────────────────────┬────────────────────────────────┤
//!            ▼                               ▼                                ▼
//!   ┌─────────────────┐            ┌──────────────────┐           GET /api/ticks/:symbol
//!   │  Spike Reactor  │──▶ Broker  │  Tick fan-out    │──▶ /ws/ticks
//!   └─────────────────┘            └──────────────────┘
//!   ┌─────────────────┐
//!   │ Cutoff Reactor  │──▶ Broker      reactors ──▶ OrderEvent ──▶ /ws/orders
//!   │ (per account)   │                reactors ──▶ AuditStore
//!   └─────────────────┘
//! ```
//!
//! See [`config`] for every environment variable.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod auth;
mod bus;
mod config;
mod engine;
mod error;
mod events;
mod fanout;
mod feed;
mod models;
mod routes;
mod state;
mod store;

use bus::TickBus;
use config::AppConfig;
use engine::{
    clock::{Clock, MarketClock},
    cutoff::CutoffReactor,
    executor::build_broker,
    spike::{SpikeBook, SpikeReactor},
    sync::PositionSync,
};
use events::EventPublisher;
use fanout::{forward_orders, forward_ticks, run_feed_watchdog, ConnectionHub, FeedHealth};
use feed::{run_ingest, simulator::run_simulator, upstream::run_upstream, FeedStats};
use models::{AdminSettings, BuyLogic};
use state::AppState;
use store::Stores;

/// Largest simulated move per interval, in basis points.
const SIMULATOR_MAX_STEP_BPS: i32 = 50;

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Load .env (optional — CI/prod can use real env vars) ──────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("tickwire=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        TICKWIRE — Live Tick Fan-out           ║
  ║     Normalizer · Bus · Spike · Cutoff         ║
  ╚═══════════════════════════════════════════════╝"#
    );

    let config = AppConfig::from_env()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // ── 3. Core pipes ────────────────────────────────────────────────────────
    let bus = Arc::new(TickBus::new(config.bus_capacity));
    let symbols = Arc::new(config.symbols.clone());
    info!(instruments = symbols.len(), "🗺️ Symbol map loaded");
    let stores = build_stores(&config).await?;
    let broker = build_broker(&config.broker_base_url, bus.clone());
    let events = EventPublisher::new(config.bus_capacity);
    let clock: Arc<dyn Clock> = Arc::new(MarketClock::new(config.market_offset));

    let feed_stats = Arc::new(FeedStats::default());
    let feed_health = Arc::new(FeedHealth::new(config.feed_stale_after));
    let tick_hub = Arc::new(ConnectionHub::new("ticks", config.client_queue_capacity));
    let order_hub = Arc::new(ConnectionHub::new("orders", config.client_queue_capacity));

    // ── 4. Feed sources → ingest ─────────────────────────────────────────────
    let (frames_tx, frames_rx) = mpsc::channel(config.bus_capacity);
    tasks.push(tokio::spawn(run_ingest(
        frames_rx,
        bus.clone(),
        symbols.clone(),
        feed_stats.clone(),
        shutdown_rx.clone(),
    )));

    if let Some(url) = config.feed_ws_url.clone() {
        tasks.push(tokio::spawn(run_upstream(
            url,
            symbols.tokens(),
            frames_tx.clone(),
            config.feed_max_backoff,
            shutdown_rx.clone(),
        )));
    }
    if config.feed_simulator {
        tasks.push(tokio::spawn(run_simulator(
            symbols.tokens(),
            frames_tx.clone(),
            config.simulator_interval,
            SIMULATOR_MAX_STEP_BPS,
            shutdown_rx.clone(),
        )));
    }
    if config.feed_ws_url.is_none() && !config.feed_simulator {
        info!("📥 No upstream feed configured — accepting HTTP push only");
    }

    // ── 5. Fan-out ───────────────────────────────────────────────────────────
    tasks.push(tokio::spawn(forward_ticks(bus.clone(), tick_hub.clone(), shutdown_rx.clone())));
    tasks.push(tokio::spawn(forward_orders(events.subscribe(), order_hub.clone(), shutdown_rx.clone())));
    tasks.push(tokio::spawn(run_feed_watchdog(
        bus.clone(),
        tick_hub.clone(),
        feed_health.clone(),
        shutdown_rx.clone(),
    )));

    // ── 6. Reactors ──────────────────────────────────────────────────────────
    let (spike_tx, spike_rx) = mpsc::channel(16);
    let spike = SpikeReactor::new(
        SpikeBook::new(config.spike_window, config.spike_threshold_percent),
        bus.clone(),
        broker.clone(),
        stores.clone(),
        events.clone(),
        clock.clone(),
        config.spike_account_id,
        config.spike_reset_on_new_session,
    );
    tasks.push(tokio::spawn(spike.run(bus.subscribe(), spike_rx, shutdown_rx.clone())));

    let accounts = match stores.credentials.active_accounts().await {
        Ok(accounts) => accounts,
        Err(err) => {
            warn!(error = %err, "⚠️ Could not load accounts — cutoff and sync reactors disabled");
            Vec::new()
        }
    };
    for account in &accounts {
        let cutoff = CutoffReactor::new(
            account.account_id,
            clock.clone(),
            stores.clone(),
            broker.clone(),
            events.clone(),
        );
        tasks.push(tokio::spawn(cutoff.run(config.order_monitor_interval, shutdown_rx.clone())));

        let sync = PositionSync::new(account.account_id, stores.clone(), broker.clone());
        tasks.push(tokio::spawn(sync.run(config.sync_positions_interval, shutdown_rx.clone())));
    }
    info!(accounts = accounts.len(), "🤖 Reactors armed");

    // ── 7. Router ────────────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        bus,
        symbols,
        frames: frames_tx,
        feed_stats,
        feed_health,
        tick_hub,
        order_hub,
        spike_commands: spike_tx,
        stores,
        shutdown: shutdown_rx,
        started_at: chrono::Utc::now(),
    });
    let app = routes::build_router(state, Arc::from(config.api_key.as_str()));

    // ── 8. Serve until Ctrl-C, then drain every task ─────────────────────────
    info!(addr = ?config.bind_addr, "🚀 Tickwire server starting");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    info!("👋 Tickwire stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Ctrl-C handler failed — shutting down");
    }
    info!("🛑 Shutdown requested");
    let _ = shutdown.send(true);
}

async fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    #[cfg(feature = "postgres")]
    {
        if let Some(url) = &config.database_url {
            let pool = store::postgres::init_pool(url).await?;
            return Ok(store::postgres::build_postgres_stores(pool));
        }
    }
    #[cfg(not(feature = "postgres"))]
    {
        if config.database_url.is_some() {
            warn!("DATABASE_URL is set but this build lacks the `postgres` feature — using memory stores");
        }
    }

    let settings = config.default_auto_sell_cutoff.map(|cutoff| AdminSettings {
        buy_logic:        BuyLogic::FixedPercent,
        buy_percent:      0.0,
        stoploss_percent: 0.0,
        auto_sell_cutoff: cutoff,
    });
    info!(accounts = config.accounts.len(), "🗃️ Using in-memory stores");
    Ok(store::memory::build_memory_stores(settings, config.accounts.clone()))
}
