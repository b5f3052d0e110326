//! # store::memory
//!
//! In-process collaborators used when no database is configured. State lives
//! behind `tokio::sync::RwLock` and is lost on restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AuditStore, CredentialStore, OrderStore, PositionStore, SettingsStore, Stores};
use crate::error::AppError;
use crate::models::{Account, AdminSettings, AuditRecord, Order, OrderStatus, Position};

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySettingsStore {
    settings: RwLock<Option<AdminSettings>>,
}

impl MemorySettingsStore {
    pub fn new(settings: Option<AdminSettings>) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    #[cfg(test)]
    pub async fn replace(&self, settings: Option<AdminSettings>) {
        *self.settings.write().await = settings;
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<AdminSettings, AppError> {
        self.settings
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::ConfigUnavailable("admin settings not configured".into()))
    }
}

// ─── Credentials ──────────────────────────────────────────────────────────────

pub struct MemoryCredentialStore {
    accounts: Vec<Account>,
}

impl MemoryCredentialStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn active_accounts(&self) -> Result<Vec<Account>, AppError> {
        Ok(self.accounts.iter().filter(|a| a.is_active()).cloned().collect())
    }

    async fn account(&self, account_id: i64) -> Result<Account, AppError> {
        self.accounts
            .iter()
            .find(|a| a.account_id == account_id && a.is_active())
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no active account {account_id}")))
    }
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: RwLock<Vec<Order>>,
}

impl MemoryOrderStore {
    #[cfg(test)]
    pub async fn insert(&self, order: Order) {
        self.orders.write().await.push(order);
    }

    #[cfg(test)]
    pub async fn get(&self, order_id: i64) -> Option<Order> {
        self.orders.read().await.iter().find(|o| o.id == order_id).cloned()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn pending_orders(&self, account_id: i64, symbol: &str) -> Result<Vec<Order>, AppError> {
        let orders = self.orders.read().await;
        Ok(orders
            .iter()
            .filter(|o| {
                o.account_id == account_id && o.symbol == symbol && o.status == OrderStatus::Pending
            })
            .cloned()
            .collect())
    }

    async fn set_status(&self, order_id: i64, status: OrderStatus) -> Result<(), AppError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;
        order.status = status;
        Ok(())
    }
}

// ─── Positions ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryPositionStore {
    positions: RwLock<BTreeMap<(i64, String), Position>>,
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn upsert(&self, position: &Position) -> Result<(), AppError> {
        let key = (position.account_id, position.symbol.clone());
        self.positions.write().await.insert(key, position.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Position>, AppError> {
        Ok(self.positions.read().await.values().cloned().collect())
    }
}

// ─── Audit ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), AppError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AppError> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

// ─── Wiring ───────────────────────────────────────────────────────────────────

pub fn build_memory_stores(settings: Option<AdminSettings>, accounts: Vec<Account>) -> Stores {
    Stores {
        settings:    Arc::new(MemorySettingsStore::new(settings)),
        credentials: Arc::new(MemoryCredentialStore::new(accounts)),
        orders:      Arc::new(MemoryOrderStore::default()),
        positions:   Arc::new(MemoryPositionStore::default()),
        audit:       Arc::new(MemoryAuditStore::default()),
    }
}
