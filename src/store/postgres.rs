//! # store::postgres — PostgreSQL collaborators
//!
//! Uses `sqlx` for async PostgreSQL. Runtime-bound queries so the crate
//! builds without a live `DATABASE_URL`.
//!
//! ## Setup
//! 1. Create the database
//! 2. Set `DATABASE_URL` in `.env`
//! 3. Run with `--features postgres`; the embedded migration is applied on
//!    startup (`migrations/001_init.sql`)
//!
//! NUMERIC columns decode through `sqlx::types::BigDecimal`; the `bigdecimal`
//! crate only supplies the float conversions.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bigdecimal::{FromPrimitive, ToPrimitive};
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::BigDecimal, Executor, PgPool};
use tracing::info;

use super::{AuditStore, CredentialStore, OrderStore, PositionStore, SettingsStore, Stores};
use crate::error::AppError;
use crate::models::{
    Account, AccountStatus, AdminSettings, AuditKind, AuditRecord, AuditStatus, BuyLogic, Order,
    OrderStatus, Position,
};

// ─── Pool Init ────────────────────────────────────────────────────────────────

/// Create the PgPool and apply the embedded migration.
pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    pool.execute(include_str!("../../migrations/001_init.sql"))
        .await
        .context("Failed to run migration 001_init.sql")?;

    info!("✅ PostgreSQL connected and migrations applied");
    Ok(pool)
}

pub fn build_postgres_stores(pool: PgPool) -> Stores {
    let store = Arc::new(PgStore { pool });
    Stores {
        settings:    store.clone(),
        credentials: store.clone(),
        orders:      store.clone(),
        positions:   store.clone(),
        audit:       store,
    }
}

pub struct PgStore {
    pool: PgPool,
}

fn to_f64(value: &BigDecimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

fn to_numeric(field: &str, value: f64) -> Result<BigDecimal, AppError> {
    BigDecimal::from_f64(value)
        .ok_or_else(|| AppError::Store(format!("{field} = {value} is not a finite number")))
}

// ─── Settings ─────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SettingsRow {
    buy_logic:        String,
    buy_percent:      BigDecimal,
    stoploss_percent: BigDecimal,
    auto_sell_cutoff: NaiveTime,
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn load(&self) -> Result<AdminSettings, AppError> {
        let row: Option<SettingsRow> = sqlx::query_as(
            "SELECT buy_logic, buy_percent, stoploss_percent, auto_sell_cutoff \
             FROM admin_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::ConfigUnavailable(e.to_string()))?;

        let row = row.ok_or_else(|| AppError::ConfigUnavailable("admin settings row missing".into()))?;
        let buy_logic = BuyLogic::parse(&row.buy_logic).ok_or_else(|| {
            AppError::ConfigUnavailable(format!("unknown buy_logic '{}'", row.buy_logic))
        })?;

        Ok(AdminSettings {
            buy_logic,
            buy_percent:      to_f64(&row.buy_percent),
            stoploss_percent: to_f64(&row.stoploss_percent),
            auto_sell_cutoff: row.auto_sell_cutoff,
        })
    }
}

// ─── Credentials ──────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct AccountRow {
    id:           i64,
    api_key:      String,
    access_token: String,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            account_id:   row.id,
            api_key:      row.api_key,
            access_token: row.access_token,
            status:       AccountStatus::Active,
        }
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn active_accounts(&self) -> Result<Vec<Account>, AppError> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            "SELECT id, api_key, access_token FROM zerodha_accounts \
             WHERE status = 'active' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Account::from).collect())
    }

    async fn account(&self, account_id: i64) -> Result<Account, AppError> {
        let row: Option<AccountRow> = sqlx::query_as(
            "SELECT id, api_key, access_token FROM zerodha_accounts \
             WHERE id = $1 AND status = 'active'",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Account::from)
            .ok_or_else(|| AppError::NotFound(format!("no active account {account_id}")))
    }
}

// ─── Orders ───────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct OrderRow {
    id:                 i64,
    zerodha_account_id: i64,
    symbol:             String,
    qty:                i64,
    target_percent:     BigDecimal,
    ltp_at_upload:      BigDecimal,
    target_price:       BigDecimal,
    stoploss_price:     BigDecimal,
    status:             String,
}

#[async_trait]
impl OrderStore for PgStore {
    async fn pending_orders(&self, account_id: i64, symbol: &str) -> Result<Vec<Order>, AppError> {
        let rows: Vec<OrderRow> = sqlx::query_as(
            "SELECT id, zerodha_account_id, symbol, qty, target_percent, ltp_at_upload, \
                    target_price, stoploss_price, status \
             FROM orders \
             WHERE zerodha_account_id = $1 AND symbol = $2 AND status = 'pending'",
        )
        .bind(account_id)
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status = OrderStatus::parse(&row.status)
                    .ok_or_else(|| AppError::Store(format!("order {} has status '{}'", row.id, row.status)))?;
                Ok(Order {
                    id:             row.id,
                    account_id:     row.zerodha_account_id,
                    symbol:         row.symbol,
                    qty:            row.qty,
                    target_percent: to_f64(&row.target_percent),
                    ltp_at_upload:  to_f64(&row.ltp_at_upload),
                    target_price:   to_f64(&row.target_price),
                    stoploss_price: to_f64(&row.stoploss_price),
                    status,
                })
            })
            .collect()
    }

    async fn set_status(&self, order_id: i64, status: OrderStatus) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE orders SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("order {order_id}")));
        }
        Ok(())
    }
}

// ─── Positions ────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct PositionRow {
    zerodha_account_id: i64,
    symbol:             String,
    quantity:           i64,
    average_price:      BigDecimal,
    pnl:                BigDecimal,
}

#[async_trait]
impl PositionStore for PgStore {
    async fn upsert(&self, position: &Position) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO positions (zerodha_account_id, symbol, quantity, average_price, pnl)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (zerodha_account_id, symbol) DO UPDATE SET
              quantity      = EXCLUDED.quantity,
              average_price = EXCLUDED.average_price,
              pnl           = EXCLUDED.pnl
            "#,
        )
        .bind(position.account_id)
        .bind(&position.symbol)
        .bind(position.quantity)
        .bind(to_numeric("average_price", position.average_price)?)
        .bind(to_numeric("pnl", position.pnl)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Position>, AppError> {
        let rows: Vec<PositionRow> = sqlx::query_as(
            "SELECT zerodha_account_id, symbol, quantity, average_price, pnl \
             FROM positions ORDER BY zerodha_account_id, symbol",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Position {
                account_id:    row.zerodha_account_id,
                symbol:        row.symbol,
                quantity:      row.quantity,
                average_price: to_f64(&row.average_price),
                pnl:           to_f64(&row.pnl),
            })
            .collect())
    }
}

// ─── Audit ────────────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct AuditRow {
    subject:    String,
    kind:       String,
    status:     String,
    message:    String,
    created_at: DateTime<Utc>,
}

#[async_trait]
impl AuditStore for PgStore {
    async fn append(&self, record: &AuditRecord) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO audit_logs (subject, kind, status, message, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&record.subject)
        .bind(record.kind.as_str())
        .bind(record.status.as_str())
        .bind(&record.message)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, AppError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT subject, kind, status, message, created_at \
             FROM audit_logs ORDER BY id DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let kind = AuditKind::parse(&row.kind)
                    .ok_or_else(|| AppError::Store(format!("unknown audit kind '{}'", row.kind)))?;
                let status = AuditStatus::parse(&row.status)
                    .ok_or_else(|| AppError::Store(format!("unknown audit status '{}'", row.status)))?;
                Ok(AuditRecord {
                    subject:   row.subject,
                    kind,
                    status,
                    message:   row.message,
                    timestamp: row.created_at,
                })
            })
            .collect()
    }
}
