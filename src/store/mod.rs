//! # store
//!
//! Persistence collaborators the core consumes but does not own. Settings,
//! credentials, orders and the audit log are CRUD'd elsewhere; the reactors
//! only read them (and append audit lines / move order status).
//!
//! Two implementations:
//! - [`memory`] — default, seeded from configuration (dev / tests)
//! - [`postgres`] — `--features postgres`, backed by `sqlx`

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::error::AppError;
use crate::models::{Account, AdminSettings, AuditRecord, Order, OrderStatus, Position};

#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// One fresh read of the singleton row. `ConfigUnavailable` when the
    /// store is unreachable or the row is missing.
    async fn load(&self) -> Result<AdminSettings, AppError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn active_accounts(&self) -> Result<Vec<Account>, AppError>;

    /// `NotFound` for unknown or inactive accounts.
    async fn account(&self, account_id: i64) -> Result<Account, AppError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn pending_orders(&self, account_id: i64, symbol: &str) -> Result<Vec<Order>, AppError>;

    async fn set_status(&self, order_id: i64, status: OrderStatus) -> Result<(), AppError>;
}

#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert or overwrite the `(account_id, symbol)` row.
    async fn upsert(&self, position: &Position) -> Result<(), AppError>;

    async fn list(&self) -> Result<Vec<Position>, AppError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append-only; records are never updated.
    async fn append(&self, record: &AuditRecord) -> Result<(), AppError>;

    /// Most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AppError>;
}

/// Every collaborator behind a trait object, cloned into each task.
#[derive(Clone)]
pub struct Stores {
    pub settings:    Arc<dyn SettingsStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub orders:      Arc<dyn OrderStore>,
    pub positions:   Arc<dyn PositionStore>,
    pub audit:       Arc<dyn AuditStore>,
}

/// Writes an audit record; a failed write becomes an operational alert
/// instead of disappearing.
pub async fn record_audit(audit: &dyn AuditStore, record: AuditRecord) {
    if let Err(err) = audit.append(&record).await {
        error!(
            alert   = true,
            error   = %err,
            subject = %record.subject,
            kind    = record.kind.as_str(),
            status  = record.status.as_str(),
            message = %record.message,
            "🚨 Audit write failed — outcome not persisted"
        );
    }
}
