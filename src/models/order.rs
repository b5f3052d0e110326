//! # models::order
//!
//! Records owned by the persistence collaborators: uploaded [`Order`]s, the
//! broker position mirror ([`Position`]) and the append-only [`AuditRecord`].
//!
//! Reactors read these for a single decision and never keep a private copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Order ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    TargetHit,
    StoplossHit,
    AutoSold,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending     => "pending",
            OrderStatus::TargetHit   => "target_hit",
            OrderStatus::StoplossHit => "stoploss_hit",
            OrderStatus::AutoSold    => "auto_sold",
            OrderStatus::Failed      => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending"      => Some(OrderStatus::Pending),
            "target_hit"   => Some(OrderStatus::TargetHit),
            "stoploss_hit" => Some(OrderStatus::StoplossHit),
            "auto_sold"    => Some(OrderStatus::AutoSold),
            "failed"       => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

/// A bulk-uploaded target/stoploss order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id:             i64,
    pub account_id:     i64,
    pub symbol:         String,
    pub qty:            i64,
    pub target_percent: f64,
    pub ltp_at_upload:  f64,
    pub target_price:   f64,
    pub stoploss_price: f64,
    pub status:         OrderStatus,
}

// ─── Position ─────────────────────────────────────────────────────────────────

/// Point-in-time mirror of one broker position. The broker stays authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id:    i64,
    pub symbol:        String,
    pub quantity:      i64,
    pub average_price: f64,
    pub pnl:           f64,
}

// ─── Audit ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    AutoSell,
    AutoSellFailed,
    SpikeBuy,
    SpikeBuyFailed,
    /// Periodic job outcome (e.g. `sync_positions`).
    Cron,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::AutoSell       => "AUTO_SELL",
            AuditKind::AutoSellFailed => "AUTO_SELL_FAILED",
            AuditKind::SpikeBuy       => "SPIKE_BUY",
            AuditKind::SpikeBuyFailed => "SPIKE_BUY_FAILED",
            AuditKind::Cron           => "CRON",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            AuditKind::AutoSell,
            AuditKind::AutoSellFailed,
            AuditKind::SpikeBuy,
            AuditKind::SpikeBuyFailed,
            AuditKind::Cron,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditStatus::Success),
            "failure" => Some(AuditStatus::Failure),
            _ => None,
        }
    }
}

/// Insert-only log line. `subject` is a job name or an order id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub subject:   String,
    pub kind:      AuditKind,
    pub status:    AuditStatus,
    pub message:   String,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn success(subject: impl Into<String>, kind: AuditKind, message: impl Into<String>) -> Self {
        Self::new(subject, kind, AuditStatus::Success, message)
    }

    pub fn failure(subject: impl Into<String>, kind: AuditKind, message: impl Into<String>) -> Self {
        Self::new(subject, kind, AuditStatus::Failure, message)
    }

    fn new(
        subject: impl Into<String>,
        kind:    AuditKind,
        status:  AuditStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            subject:   subject.into(),
            kind,
            status,
            message:   message.into(),
            timestamp: Utc::now(),
        }
    }
}
