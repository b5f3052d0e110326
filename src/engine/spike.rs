//! # engine::spike — Spike Reactor
//!
//! Watches every tick, keeps a rolling price window per symbol and fires a
//! single market BUY (qty 1, MIS) the first time
//! `(ltp - mean(window)) / mean(window) * 100 >= threshold`.
//!
//! ## Ownership
//! [`SpikeBook`] is owned by the reactor task alone. Resets arrive as
//! [`SpikeCommand`]s over an mpsc channel, so no lock guards the per-symbol
//! state.
//!
//! ## Latch
//! The latch is set *before* the broker call and stays set if the broker
//! rejects the order: a market order is never retried automatically. Only
//! an explicit reset (operator command, or the opt-in new-session reset)
//! re-arms a symbol.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::executor::{Broker, OrderAck, OrderRequest, OrderSide};
use crate::bus::{BusRecvError, TickBus, TickSubscription};
use crate::error::AppError;
use crate::events::{EventPublisher, OrderEvent};
use crate::models::{Account, AuditKind, AuditRecord, TickSummary};
use crate::store::{record_audit, Stores};

// ─── Price Window ─────────────────────────────────────────────────────────────

/// Bounded FIFO of recent prices; the oldest price is evicted on overflow.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    capacity: usize,
    prices:   VecDeque<f64>,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            prices: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends `price`, returning the evicted oldest price if the window was full.
    pub fn push(&mut self, price: f64) -> Option<f64> {
        let evicted = if self.prices.len() == self.capacity {
            self.prices.pop_front()
        } else {
            None
        };
        self.prices.push_back(price);
        evicted
    }

    /// Mean over whatever samples exist; `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.prices.is_empty() {
            return None;
        }
        Some(self.prices.iter().sum::<f64>() / self.prices.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.prices.iter().copied()
    }
}

// ─── Latch ────────────────────────────────────────────────────────────────────

/// One-way flag. There is no `unset`: re-arming replaces the whole latch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Latch(bool);

impl Latch {
    pub fn set(&mut self) {
        self.0 = true;
    }

    pub fn is_set(&self) -> bool {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct SpikeState {
    pub window: PriceWindow,
    pub latch:  Latch,
}

// ─── Spike Book ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct BuyIntent {
    pub symbol:        String,
    pub ltp:           f64,
    pub average:       f64,
    pub spike_percent: f64,
    pub order:         OrderRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SpikeDecision {
    /// Below threshold (or no usable average).
    Hold { spike_percent: f64 },
    /// Above threshold but this symbol already fired.
    Latched { spike_percent: f64 },
    Fire(BuyIntent),
}

/// Per-symbol spike state, created on the first tick for a symbol and never
/// dropped implicitly.
#[derive(Debug)]
pub struct SpikeBook {
    window_len: usize,
    threshold:  f64,
    states:     HashMap<String, SpikeState>,
}

impl SpikeBook {
    pub fn new(window_len: usize, threshold: f64) -> Self {
        Self {
            window_len,
            threshold,
            states: HashMap::new(),
        }
    }

    pub fn observe(&mut self, tick: &TickSummary) -> SpikeDecision {
        let window_len = self.window_len;
        let state = self
            .states
            .entry(tick.symbol.clone())
            .or_insert_with(|| SpikeState {
                window: PriceWindow::new(window_len),
                latch:  Latch::default(),
            });

        state.window.push(tick.ltp);
        let average = match state.window.mean() {
            Some(avg) if avg > 0.0 => avg,
            _ => return SpikeDecision::Hold { spike_percent: 0.0 },
        };
        let spike_percent = (tick.ltp - average) / average * 100.0;

        if spike_percent < self.threshold {
            return SpikeDecision::Hold { spike_percent };
        }
        if state.latch.is_set() {
            return SpikeDecision::Latched { spike_percent };
        }

        state.latch.set();
        SpikeDecision::Fire(BuyIntent {
            symbol: tick.symbol.clone(),
            ltp: tick.ltp,
            average,
            spike_percent,
            order: OrderRequest::market(tick.symbol.clone(), OrderSide::Buy, 1),
        })
    }

    /// Re-arms one symbol. Returns `false` if the symbol was never seen.
    pub fn reset(&mut self, symbol: &str) -> bool {
        match self.states.get_mut(symbol) {
            Some(state) => {
                state.latch = Latch::default();
                true
            }
            None => false,
        }
    }

    /// Re-arms every symbol; returns how many latches were set.
    pub fn reset_all(&mut self) -> usize {
        let mut cleared = 0;
        for state in self.states.values_mut() {
            if state.latch.is_set() {
                cleared += 1;
            }
            state.latch = Latch::default();
        }
        cleared
    }

    pub fn state(&self, symbol: &str) -> Option<&SpikeState> {
        self.states.get(symbol)
    }

    /// Newest sample for `symbol`, if it has ticked.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.states.get(symbol).and_then(|state| state.window.last())
    }
}

// ─── Reactor ──────────────────────────────────────────────────────────────────

/// Operator commands delivered to the reactor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpikeCommand {
    Reset { symbol: String },
    ResetAll,
}

pub struct SpikeReactor {
    book:       SpikeBook,
    bus:        Arc<TickBus>,
    broker:     Arc<dyn Broker>,
    stores:     Stores,
    events:     EventPublisher,
    clock:      Arc<dyn Clock>,
    /// `None` → first active account.
    account_id: Option<i64>,
    reset_on_new_session: bool,
    session:    Option<NaiveDate>,
}

impl SpikeReactor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book:       SpikeBook,
        bus:        Arc<TickBus>,
        broker:     Arc<dyn Broker>,
        stores:     Stores,
        events:     EventPublisher,
        clock:      Arc<dyn Clock>,
        account_id: Option<i64>,
        reset_on_new_session: bool,
    ) -> Self {
        Self {
            book,
            bus,
            broker,
            stores,
            events,
            clock,
            account_id,
            reset_on_new_session,
            session: None,
        }
    }

    /// Evaluates one tick; places the buy when it fires.
    pub async fn on_tick(&mut self, tick: &TickSummary) -> SpikeDecision {
        if self.reset_on_new_session {
            self.roll_session();
        }

        let decision = self.book.observe(tick);
        match &decision {
            SpikeDecision::Fire(intent) => self.execute(intent).await,
            SpikeDecision::Latched { spike_percent } => {
                let samples = self.book.state(&tick.symbol).map(|s| s.window.len()).unwrap_or_default();
                debug!(symbol = %tick.symbol, spike_percent, samples, "spike ignored — latch already set");
            }
            SpikeDecision::Hold { .. } => {}
        }
        decision
    }

    pub fn apply(&mut self, command: SpikeCommand) {
        match command {
            SpikeCommand::Reset { symbol } => {
                let known = self.book.reset(&symbol);
                info!(symbol = %symbol, known, "🔄 Spike latch reset");
            }
            SpikeCommand::ResetAll => {
                let cleared = self.book.reset_all();
                info!(cleared, "🔄 All spike latches reset");
            }
        }
    }

    fn roll_session(&mut self) {
        let today = self.clock.now().date();
        if self.session == Some(today) {
            return;
        }
        if self.session.is_some() {
            let cleared = self.book.reset_all();
            info!(%today, cleared, "🌅 New session — spike latches re-armed");
        }
        self.session = Some(today);
    }

    async fn execute(&self, intent: &BuyIntent) {
        info!(
            symbol        = %intent.symbol,
            ltp           = intent.ltp,
            average       = intent.average,
            spike_percent = intent.spike_percent,
            "📈 Spike detected — firing BUY"
        );
        self.events.publish(&OrderEvent::SpikeBuyFired {
            symbol:        intent.symbol.clone(),
            ltp:           intent.ltp,
            average:       intent.average,
            spike_percent: intent.spike_percent,
        });

        match self.place(intent).await {
            Ok((account, ack)) => {
                record_audit(
                    self.stores.audit.as_ref(),
                    AuditRecord::success(
                        ack.order_id.clone(),
                        AuditKind::SpikeBuy,
                        format!(
                            "BUY {} {} @ {:.2} (avg {:.2}, +{:.2}%)",
                            intent.order.quantity, intent.symbol, intent.ltp, intent.average, intent.spike_percent
                        ),
                    ),
                )
                .await;
                self.events.publish(&OrderEvent::SpikeBuyPlaced {
                    account_id: account.account_id,
                    symbol:     intent.symbol.clone(),
                    order_id:   ack.order_id,
                });
            }
            Err(err) => {
                error!(
                    alert  = true,
                    symbol = %intent.symbol,
                    error  = %err,
                    "🚨 Spike BUY failed — latch stays set until reset"
                );
                record_audit(
                    self.stores.audit.as_ref(),
                    AuditRecord::failure(intent.symbol.clone(), AuditKind::SpikeBuyFailed, err.to_string()),
                )
                .await;
                self.events.publish(&OrderEvent::SpikeBuyFailed {
                    symbol: intent.symbol.clone(),
                    error:  err.to_string(),
                });
            }
        }
    }

    async fn place(&self, intent: &BuyIntent) -> Result<(Account, OrderAck), AppError> {
        let account = match self.account_id {
            Some(id) => self.stores.credentials.account(id).await?,
            None => self
                .stores
                .credentials
                .active_accounts()
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| AppError::NotFound("no active account for spike buys".into()))?,
        };
        let ack = self.broker.place_order(&account, &intent.order).await?;
        Ok((account, ack))
    }

    /// After a lag, feeds each instrument's latest tick once, skipping those
    /// whose latest price already is the newest sample in their window.
    pub async fn catch_up(&mut self) -> usize {
        let mut replayed = 0;
        for tick in self.bus.snapshot().await {
            if self.book.last_price(&tick.symbol) == Some(tick.ltp) {
                continue;
            }
            self.on_tick(&tick.summary()).await;
            replayed += 1;
        }
        replayed
    }

    /// Long-running task: ticks in, commands in, until shutdown.
    pub async fn run(
        mut self,
        mut ticks:    TickSubscription,
        mut commands: mpsc::Receiver<SpikeCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            window    = self.book.window_len,
            threshold = self.book.threshold,
            "📈 Spike reactor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.apply(command),
                received = ticks.recv() => match received {
                    Ok(tick) => {
                        self.on_tick(&tick.summary()).await;
                    }
                    Err(BusRecvError::Lagged(skipped)) => {
                        let replayed = self.catch_up().await;
                        warn!(skipped, replayed, "⚠️ Spike reactor lagged — re-read latest ticks");
                    }
                    Err(BusRecvError::Closed) => break,
                },
            }
        }

        info!("📈 Spike reactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::tests::ManualClock;
    use crate::engine::executor::PaperBroker;
    use crate::models::{Account, AuditStatus};
    use crate::store::memory::build_memory_stores;

    fn summary(symbol: &str, ltp: f64) -> TickSummary {
        TickSummary { symbol: symbol.into(), ltp }
    }

    struct Harness {
        reactor: SpikeReactor,
        broker:  Arc<PaperBroker>,
        stores:  Stores,
        events:  tokio::sync::broadcast::Receiver<Arc<str>>,
    }

    fn harness(reset_on_new_session: bool) -> (Harness, Arc<ManualClock>) {
        let bus = Arc::new(TickBus::new(64));
        let broker = Arc::new(PaperBroker::new(bus.clone()));
        let stores = build_memory_stores(None, Account::parse_list("1:key:token"));
        let events = EventPublisher::new(64);
        let rx = events.subscribe();
        let clock = Arc::new(ManualClock::at((2024, 6, 10), (10, 0, 0)));
        let reactor = SpikeReactor::new(
            SpikeBook::new(15, 2.0),
            bus,
            broker.clone(),
            stores.clone(),
            events,
            clock.clone(),
            None,
            reset_on_new_session,
        );
        (Harness { reactor, broker, stores, events: rx }, clock)
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut book = SpikeBook::new(15, 2.0);
        for i in 0..16 {
            book.observe(&summary("INFY", 100.0 + f64::from(i)));
        }
        let window = &book.state("INFY").unwrap().window;
        assert_eq!(window.len(), 15);
        let prices: Vec<f64> = window.iter().collect();
        assert_eq!(prices.first().copied(), Some(101.0));
        assert_eq!(prices.last().copied(), Some(115.0));
    }

    #[test]
    fn price_window_push_reports_eviction() {
        let mut window = PriceWindow::new(2);
        assert_eq!(window.push(1.0), None);
        assert_eq!(window.push(2.0), None);
        assert_eq!(window.push(3.0), Some(1.0));
        assert_eq!(window.mean(), Some(2.5));
    }

    #[test]
    fn spike_fires_once_and_latch_holds() {
        let mut book = SpikeBook::new(15, 2.0);
        for _ in 0..3 {
            assert!(matches!(book.observe(&summary("INFY", 100.0)), SpikeDecision::Hold { .. }));
        }

        // 103 against mean([100, 100, 100, 103]) = 100.75 → +2.23%
        let SpikeDecision::Fire(intent) = book.observe(&summary("INFY", 103.0)) else {
            panic!("expected a buy intent");
        };
        assert_eq!(intent.order.side, OrderSide::Buy);
        assert_eq!(intent.order.quantity, 1);
        assert!((intent.spike_percent - 2.2333).abs() < 1e-3);

        assert!(matches!(book.observe(&summary("INFY", 103.0)), SpikeDecision::Hold { .. }));
        assert!(matches!(book.observe(&summary("INFY", 110.0)), SpikeDecision::Latched { .. }));
    }

    #[test]
    fn single_sample_never_spikes() {
        let mut book = SpikeBook::new(15, 2.0);
        assert_eq!(
            book.observe(&summary("INFY", 500.0)),
            SpikeDecision::Hold { spike_percent: 0.0 }
        );
    }

    #[test]
    fn symbols_latch_independently() {
        let mut book = SpikeBook::new(15, 2.0);
        book.observe(&summary("INFY", 100.0));
        book.observe(&summary("TCS", 100.0));
        assert!(matches!(book.observe(&summary("INFY", 110.0)), SpikeDecision::Fire(_)));
        assert!(matches!(book.observe(&summary("TCS", 110.0)), SpikeDecision::Fire(_)));
    }

    #[tokio::test]
    async fn fired_spike_places_one_buy_and_audits() {
        let (mut h, _) = harness(false);
        h.reactor.on_tick(&summary("INFY", 100.0)).await;
        h.reactor.on_tick(&summary("INFY", 110.0)).await;
        h.reactor.on_tick(&summary("INFY", 120.0)).await;

        assert_eq!(h.broker.fill_count().await, 1);
        let audit = h.stores.audit.recent(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, AuditKind::SpikeBuy);
        assert_eq!(audit[0].status, AuditStatus::Success);

        assert!(h.events.recv().await.unwrap().contains("SPIKE_BUY_FIRED"));
        assert!(h.events.recv().await.unwrap().contains("SPIKE_BUY_PLACED"));
    }

    #[tokio::test]
    async fn broker_failure_keeps_latch_set() {
        let (mut h, _) = harness(false);
        h.broker.reject("INFY").await;

        h.reactor.on_tick(&summary("INFY", 100.0)).await;
        assert!(matches!(h.reactor.on_tick(&summary("INFY", 110.0)).await, SpikeDecision::Fire(_)));
        assert!(matches!(
            h.reactor.on_tick(&summary("INFY", 130.0)).await,
            SpikeDecision::Latched { .. }
        ));

        let audit = h.stores.audit.recent(10).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].kind, AuditKind::SpikeBuyFailed);
        assert_eq!(audit[0].status, AuditStatus::Failure);
        assert!(h.reactor.book.state("INFY").unwrap().latch.is_set());
    }

    #[tokio::test]
    async fn reset_command_rearms_symbol() {
        let (mut h, _) = harness(false);
        h.reactor.on_tick(&summary("INFY", 100.0)).await;
        h.reactor.on_tick(&summary("INFY", 110.0)).await;

        h.reactor.apply(SpikeCommand::Reset { symbol: "INFY".into() });
        assert!(!h.reactor.book.state("INFY").unwrap().latch.is_set());
        assert!(matches!(h.reactor.on_tick(&summary("INFY", 140.0)).await, SpikeDecision::Fire(_)));
        assert_eq!(h.broker.fill_count().await, 2);
    }

    #[tokio::test]
    async fn new_session_rearms_only_when_enabled() {
        for enabled in [false, true] {
            let (mut h, clock) = harness(enabled);
            h.reactor.on_tick(&summary("INFY", 100.0)).await;
            h.reactor.on_tick(&summary("INFY", 110.0)).await;

            clock.set((2024, 6, 11), (9, 15, 0));
            let next = h.reactor.on_tick(&summary("INFY", 150.0)).await;
            assert_eq!(matches!(next, SpikeDecision::Fire(_)), enabled);
        }
    }

    #[tokio::test]
    async fn catch_up_skips_prices_already_sampled() {
        let (mut h, _) = harness(false);
        let bus = h.reactor.bus.clone();
        for (token, symbol, ltp) in [(408065, "INFY", 100.0), (2953217, "TCS", 200.0)] {
            bus.publish(crate::bus::tests::tick(token, symbol, ltp)).await;
            h.reactor.on_tick(&summary(symbol, ltp)).await;
        }
        // Missed while lagging.
        bus.publish(crate::bus::tests::tick(408065, "INFY", 101.0)).await;

        assert_eq!(h.reactor.catch_up().await, 1);
        assert_eq!(h.reactor.book.state("INFY").unwrap().window.len(), 2);
        assert_eq!(h.reactor.book.last_price("INFY"), Some(101.0));
        assert_eq!(h.reactor.book.state("TCS").unwrap().window.len(), 1);

        assert_eq!(h.reactor.catch_up().await, 0);
    }

    #[tokio::test]
    async fn run_loop_applies_commands_and_stops() {
        let (h, _) = harness(false);
        let bus = h.reactor.bus.clone();
        let ticks = bus.subscribe();
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker = h.broker.clone();
        let handle = tokio::spawn(h.reactor.run(ticks, cmd_rx, shutdown_rx));

        bus.publish(crate::bus::tests::tick(408065, "INFY", 100.0)).await;
        bus.publish(crate::bus::tests::tick(408065, "INFY", 110.0)).await;
        cmd_tx.send(SpikeCommand::ResetAll).await.unwrap();
        bus.publish(crate::bus::tests::tick(408065, "INFY", 150.0)).await;

        for _ in 0..50 {
            if broker.fill_count().await >= 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(broker.fill_count().await >= 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
