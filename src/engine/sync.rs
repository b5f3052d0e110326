//! # engine::sync — position sync job
//!
//! Mirrors each account's broker book into the position store on a fixed
//! interval. Only long positions (`quantity > 0`) are upserted; every run
//! leaves one `sync_positions` cron audit line.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use super::executor::Broker;
use crate::error::AppError;
use crate::models::{AuditKind, AuditRecord, Position};
use crate::store::{record_audit, Stores};

const JOB_NAME: &str = "sync_positions";

pub struct PositionSync {
    account_id: i64,
    stores:     Stores,
    broker:     Arc<dyn Broker>,
}

impl PositionSync {
    pub fn new(account_id: i64, stores: Stores, broker: Arc<dyn Broker>) -> Self {
        Self { account_id, stores, broker }
    }

    /// One sync pass, audited either way. Returns the number of rows upserted.
    pub async fn run_cycle(&self) -> Result<usize, AppError> {
        let result = self.sync().await;
        let record = match &result {
            Ok(count) => AuditRecord::success(
                JOB_NAME,
                AuditKind::Cron,
                format!("account {}: {count} positions synced", self.account_id),
            ),
            Err(err) => AuditRecord::failure(
                JOB_NAME,
                AuditKind::Cron,
                format!("account {}: {err}", self.account_id),
            ),
        };
        record_audit(self.stores.audit.as_ref(), record).await;
        result
    }

    async fn sync(&self) -> Result<usize, AppError> {
        let account = self.stores.credentials.account(self.account_id).await?;
        let book = self.broker.positions(&account).await?;

        let mut synced = 0;
        for row in book.into_iter().filter(|p| p.quantity > 0) {
            self.stores
                .positions
                .upsert(&Position {
                    account_id:    self.account_id,
                    symbol:        row.symbol,
                    quantity:      row.quantity,
                    average_price: row.average_price,
                    pnl:           row.pnl,
                })
                .await?;
            synced += 1;
        }
        Ok(synced)
    }

    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(account_id = self.account_id, ?interval, "🔁 Position sync started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.run_cycle().await {
                Ok(count) => info!(account_id = self.account_id, count, "🔁 Positions synced"),
                Err(err) => warn!(account_id = self.account_id, error = %err, "⚠️ Position sync failed"),
            }
        }

        info!(account_id = self.account_id, "🔁 Position sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TickBus;
    use crate::engine::executor::PaperBroker;
    use crate::models::{Account, AuditStatus};
    use crate::store::memory::build_memory_stores;

    #[tokio::test]
    async fn only_long_positions_are_synced() {
        let broker = Arc::new(PaperBroker::new(Arc::new(TickBus::new(8))));
        broker.seed(1, "INFY", 5, 1500.0).await;
        broker.seed(1, "TCS", 0, 0.0).await;
        broker.seed(2, "WIPRO", 9, 450.0).await;
        let stores = build_memory_stores(None, Account::parse_list("1:key:token"));

        let sync = PositionSync::new(1, stores.clone(), broker);
        assert_eq!(sync.run_cycle().await.unwrap(), 1);

        let rows = stores.positions.list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "INFY");
        assert_eq!(rows[0].quantity, 5);

        let audit = stores.audit.recent(1).await.unwrap();
        assert_eq!(audit[0].subject, "sync_positions");
        assert_eq!(audit[0].status, AuditStatus::Success);
    }

    #[tokio::test]
    async fn unknown_account_is_audited_as_failure() {
        let broker = Arc::new(PaperBroker::new(Arc::new(TickBus::new(8))));
        let stores = build_memory_stores(None, Vec::new());

        let sync = PositionSync::new(9, stores.clone(), broker);
        assert!(sync.run_cycle().await.is_err());

        let audit = stores.audit.recent(1).await.unwrap();
        assert_eq!(audit[0].kind, AuditKind::Cron);
        assert_eq!(audit[0].status, AuditStatus::Failure);
    }
}
