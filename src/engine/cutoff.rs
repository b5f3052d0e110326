//! # engine::cutoff — Cutoff Reactor
//!
//! One instance per active account. Every poll cycle it:
//! 1. rolls the session on a new market-local day (old session → `Settled`)
//! 2. re-reads `auto_sell_cutoff` (holding the last-known value on failure)
//! 3. at or after the cutoff, sells the full quantity of every long position
//!
//! Liquidation repeats each cycle while the phase is `AtOrAfterCutoff`; an
//! already-flat book yields no orders, so a failed sell is retried on the
//! next poll without ever double-selling.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::executor::{Broker, BrokerPosition, OrderRequest, OrderSide};
use crate::events::{EventPublisher, OrderEvent};
use crate::models::{Account, AuditKind, AuditRecord, OrderStatus};
use crate::store::{record_audit, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    BeforeCutoff,
    AtOrAfterCutoff,
    Settled,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub sells_placed: usize,
    pub sells_failed: usize,
}

pub struct CutoffReactor {
    account_id: i64,
    clock:      Arc<dyn Clock>,
    stores:     Stores,
    broker:     Arc<dyn Broker>,
    events:     EventPublisher,
    phase:      SessionPhase,
    session:    Option<NaiveDate>,
    /// Last successfully read cutoff.
    cutoff:     Option<NaiveTime>,
}

impl CutoffReactor {
    pub fn new(
        account_id: i64,
        clock:      Arc<dyn Clock>,
        stores:     Stores,
        broker:     Arc<dyn Broker>,
        events:     EventPublisher,
    ) -> Self {
        Self {
            account_id,
            clock,
            stores,
            broker,
            events,
            phase:   SessionPhase::BeforeCutoff,
            session: None,
            cutoff:  None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let now = self.clock.now();
        self.roll_session(now.date());
        self.refresh_cutoff().await;

        let Some(cutoff) = self.cutoff else {
            return CycleReport::default();
        };
        if now.time() < cutoff {
            return CycleReport::default();
        }

        if self.phase == SessionPhase::BeforeCutoff {
            self.phase = SessionPhase::AtOrAfterCutoff;
            info!(account_id = self.account_id, %cutoff, "⏰ Auto-sell cutoff reached");
            self.events.publish(&OrderEvent::CutoffReached {
                account_id: self.account_id,
                session:    now.date(),
                cutoff,
            });
        }

        self.liquidate(cutoff).await
    }

    fn roll_session(&mut self, today: NaiveDate) {
        match self.session {
            Some(current) if current == today => {}
            Some(previous) => {
                self.phase = SessionPhase::Settled;
                info!(account_id = self.account_id, session = %previous, "🌙 Session settled");
                self.events.publish(&OrderEvent::SessionSettled {
                    account_id: self.account_id,
                    session:    previous,
                });
                self.session = Some(today);
                self.phase = SessionPhase::BeforeCutoff;
            }
            None => {
                self.session = Some(today);
                self.phase = SessionPhase::BeforeCutoff;
            }
        }
    }

    async fn refresh_cutoff(&mut self) {
        match self.stores.settings.load().await {
            Ok(settings) => {
                if self.cutoff != Some(settings.auto_sell_cutoff) {
                    debug!(
                        account_id = self.account_id,
                        cutoff = %settings.auto_sell_cutoff,
                        "auto-sell cutoff loaded"
                    );
                }
                self.cutoff = Some(settings.auto_sell_cutoff);
            }
            Err(err) => {
                warn!(
                    account_id = self.account_id,
                    error      = %err,
                    held       = ?self.cutoff,
                    "⚠️ Settings unavailable — holding last-known cutoff"
                );
            }
        }
    }

    /// Sells every long position once. Each position succeeds or fails
    /// independently; nothing is retried within the cycle.
    async fn liquidate(&self, cutoff: NaiveTime) -> CycleReport {
        let mut report = CycleReport::default();

        let account = match self.stores.credentials.account(self.account_id).await {
            Ok(account) => account,
            Err(err) => {
                warn!(account_id = self.account_id, error = %err, "⚠️ No credentials — skipping auto-sell");
                return report;
            }
        };
        let positions = match self.broker.positions(&account).await {
            Ok(positions) => positions,
            Err(err) => {
                warn!(account_id = self.account_id, error = %err, "⚠️ Position fetch failed — retry next cycle");
                return report;
            }
        };

        for position in positions.into_iter().filter(|p| p.quantity > 0) {
            if self.sell(&account, &position, cutoff).await {
                report.sells_placed += 1;
            } else {
                report.sells_failed += 1;
            }
        }
        report
    }

    async fn sell(&self, account: &Account, position: &BrokerPosition, cutoff: NaiveTime) -> bool {
        let order = OrderRequest::market(position.symbol.clone(), OrderSide::Sell, position.quantity);

        match self.broker.place_order(account, &order).await {
            Ok(ack) => {
                info!(
                    account_id = account.account_id,
                    symbol     = %position.symbol,
                    quantity   = position.quantity,
                    order_id   = %ack.order_id,
                    "💰 Auto-sell placed"
                );
                record_audit(
                    self.stores.audit.as_ref(),
                    AuditRecord::success(
                        ack.order_id.clone(),
                        AuditKind::AutoSell,
                        format!("SELL {} {} at cutoff {cutoff}", position.quantity, position.symbol),
                    ),
                )
                .await;
                self.events.publish(&OrderEvent::AutoSellPlaced {
                    account_id: account.account_id,
                    symbol:     position.symbol.clone(),
                    quantity:   position.quantity,
                    order_id:   ack.order_id,
                });
                self.mark_auto_sold(account.account_id, &position.symbol).await;
                true
            }
            Err(err) => {
                error!(
                    alert      = true,
                    account_id = account.account_id,
                    symbol     = %position.symbol,
                    error      = %err,
                    "🚨 Auto-sell failed — retry next cycle"
                );
                record_audit(
                    self.stores.audit.as_ref(),
                    AuditRecord::failure(position.symbol.clone(), AuditKind::AutoSellFailed, err.to_string()),
                )
                .await;
                self.events.publish(&OrderEvent::AutoSellFailed {
                    account_id: account.account_id,
                    symbol:     position.symbol.clone(),
                    quantity:   position.quantity,
                    error:      err.to_string(),
                });
                false
            }
        }
    }

    async fn mark_auto_sold(&self, account_id: i64, symbol: &str) {
        let pending = match self.stores.orders.pending_orders(account_id, symbol).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(account_id, symbol, error = %err, "⚠️ Could not load pending orders");
                return;
            }
        };

        for order in pending {
            match self.stores.orders.set_status(order.id, OrderStatus::AutoSold).await {
                Ok(()) => self.events.publish(&OrderEvent::OrderStatusChanged {
                    order_id:   order.id,
                    account_id,
                    symbol:     symbol.to_string(),
                    status:     OrderStatus::AutoSold,
                }),
                Err(err) => warn!(order_id = order.id, error = %err, "⚠️ Order status update failed"),
            }
        }
    }

    /// Long-running task: one cycle per `interval` until shutdown. A cycle in
    /// progress (including its broker calls) always completes.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(account_id = self.account_id, ?interval, "⏰ Cutoff reactor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let report = self.run_cycle().await;
            if report != CycleReport::default() {
                info!(
                    account_id = self.account_id,
                    phase      = ?self.phase(),
                    placed     = report.sells_placed,
                    failed     = report.sells_failed,
                    "⏰ Auto-sell cycle finished"
                );
            }
        }

        info!(account_id = self.account_id, "⏰ Cutoff reactor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TickBus;
    use crate::engine::clock::tests::ManualClock;
    use crate::engine::executor::PaperBroker;
    use crate::models::{AdminSettings, AuditStatus, BuyLogic, Order};
    use crate::store::memory::{MemoryOrderStore, MemorySettingsStore};

    fn settings(cutoff: (u32, u32)) -> AdminSettings {
        AdminSettings {
            buy_logic:        BuyLogic::FixedPercent,
            buy_percent:      1.0,
            stoploss_percent: 1.0,
            auto_sell_cutoff: NaiveTime::from_hms_opt(cutoff.0, cutoff.1, 0).unwrap(),
        }
    }

    struct Harness {
        reactor:  CutoffReactor,
        clock:    Arc<ManualClock>,
        broker:   Arc<PaperBroker>,
        stores:   Stores,
        settings: Arc<MemorySettingsStore>,
        orders:   Arc<MemoryOrderStore>,
    }

    async fn harness(cutoff: Option<(u32, u32)>) -> Harness {
        let clock = Arc::new(ManualClock::at((2024, 6, 10), (15, 29, 59)));
        let broker = Arc::new(PaperBroker::new(Arc::new(TickBus::new(8))));
        let settings = Arc::new(MemorySettingsStore::new(cutoff.map(settings)));
        let orders = Arc::new(MemoryOrderStore::default());
        let mut stores = crate::store::memory::build_memory_stores(None, Account::parse_list("1:key:token"));
        stores.settings = settings.clone();
        stores.orders = orders.clone();

        let reactor = CutoffReactor::new(1, clock.clone(), stores.clone(), broker.clone(), EventPublisher::new(32));
        Harness { reactor, clock, broker, stores, settings, orders }
    }

    #[tokio::test]
    async fn nothing_sells_before_cutoff() {
        let mut h = harness(Some((15, 30))).await;
        h.broker.seed(1, "INFY", 5, 1500.0).await;

        assert_eq!(h.reactor.run_cycle().await, CycleReport::default());
        assert_eq!(h.reactor.phase(), SessionPhase::BeforeCutoff);
        assert_eq!(h.broker.fill_count().await, 0);
    }

    #[tokio::test]
    async fn cutoff_sells_each_long_position_independently() {
        let mut h = harness(Some((15, 30))).await;
        h.broker.seed(1, "INFY", 5, 1500.0).await;
        h.broker.seed(1, "TCS", 2, 3800.0).await;
        h.broker.seed(1, "WIPRO", 0, 0.0).await;
        h.broker.reject("TCS").await;

        h.clock.set((2024, 6, 10), (15, 30, 0));
        let report = h.reactor.run_cycle().await;
        assert_eq!(report, CycleReport { sells_placed: 1, sells_failed: 1 });
        assert_eq!(h.reactor.phase(), SessionPhase::AtOrAfterCutoff);

        let audit = h.stores.audit.recent(10).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().any(|r| r.kind == AuditKind::AutoSell && r.status == AuditStatus::Success));
        assert!(audit.iter().any(|r| r.kind == AuditKind::AutoSellFailed && r.subject == "TCS"));

        // INFY is flat now; only the failed TCS sell is retried.
        let retry = h.reactor.run_cycle().await;
        assert_eq!(retry, CycleReport { sells_placed: 0, sells_failed: 1 });
    }

    #[tokio::test]
    async fn flat_book_places_no_orders() {
        let mut h = harness(Some((15, 30))).await;
        h.clock.set((2024, 6, 10), (15, 45, 0));

        assert_eq!(h.reactor.run_cycle().await, CycleReport::default());
        assert_eq!(h.reactor.phase(), SessionPhase::AtOrAfterCutoff);
        assert_eq!(h.broker.fill_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_cutoff_never_sells() {
        let mut h = harness(None).await;
        h.broker.seed(1, "INFY", 5, 1500.0).await;
        h.clock.set((2024, 6, 10), (23, 59, 59));

        assert_eq!(h.reactor.run_cycle().await, CycleReport::default());
        assert_eq!(h.broker.fill_count().await, 0);
    }

    #[tokio::test]
    async fn settings_outage_holds_last_cutoff() {
        let mut h = harness(Some((15, 30))).await;
        h.broker.seed(1, "INFY", 5, 1500.0).await;
        h.reactor.run_cycle().await;

        h.settings.replace(None).await;
        h.clock.set((2024, 6, 10), (15, 31, 0));
        let report = h.reactor.run_cycle().await;
        assert_eq!(report.sells_placed, 1);
    }

    #[tokio::test]
    async fn auto_sell_moves_pending_orders() {
        let mut h = harness(Some((15, 30))).await;
        h.broker.seed(1, "INFY", 5, 1500.0).await;
        h.orders
            .insert(Order {
                id:             42,
                account_id:     1,
                symbol:         "INFY".into(),
                qty:            5,
                target_percent: 2.0,
                ltp_at_upload:  1500.0,
                target_price:   1530.0,
                stoploss_price: 1485.0,
                status:         OrderStatus::Pending,
            })
            .await;

        h.clock.set((2024, 6, 10), (15, 30, 0));
        h.reactor.run_cycle().await;
        assert_eq!(h.orders.get(42).await.unwrap().status, OrderStatus::AutoSold);
    }

    #[tokio::test]
    async fn new_day_starts_a_fresh_session() {
        let mut h = harness(Some((15, 30))).await;
        h.clock.set((2024, 6, 10), (15, 30, 0));
        h.reactor.run_cycle().await;
        assert_eq!(h.reactor.phase(), SessionPhase::AtOrAfterCutoff);

        let mut events = h.reactor.events.subscribe();
        h.clock.set((2024, 6, 11), (9, 15, 0));
        h.reactor.run_cycle().await;
        assert_eq!(h.reactor.phase(), SessionPhase::BeforeCutoff);
        assert!(events.recv().await.unwrap().contains("SESSION_SETTLED"));
    }
}
