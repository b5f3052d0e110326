//! # models::settings
//!
//! Admin configuration and broker credentials, both read through external
//! collaborators and never written by the core.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

// ─── AdminSettings ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuyLogic {
    FixedPercent,
    OffsetLtp,
}

impl BuyLogic {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed_percent" => Some(BuyLogic::FixedPercent),
            "offset_ltp"    => Some(BuyLogic::OffsetLtp),
            _ => None,
        }
    }
}

/// Singleton admin settings row.
///
/// Reactors re-read this every cycle; it can change between cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSettings {
    pub buy_logic:        BuyLogic,
    pub buy_percent:      f64,
    pub stoploss_percent: f64,
    /// Market-local time of day after which long positions are liquidated.
    pub auto_sell_cutoff: NaiveTime,
}

// ─── Account ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

/// Broker credentials for one trading account.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_id:   i64,
    pub api_key:      String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub status:       AccountStatus,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Parses `"1:key:token,2:key:token"`; every parsed account is active.
    pub fn parse_list(raw: &str) -> Vec<Account> {
        raw.split(',')
            .filter_map(|entry| {
                let mut parts = entry.trim().splitn(3, ':');
                let account_id = parts.next()?.trim().parse().ok()?;
                let api_key = parts.next()?.trim().to_string();
                let access_token = parts.next()?.trim().to_string();
                Some(Account {
                    account_id,
                    api_key,
                    access_token,
                    status: AccountStatus::Active,
                })
            })
            .collect()
    }
}

// Credentials must never reach a log line.
impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("account_id", &self.account_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_account_list() {
        let accounts = Account::parse_list("7:key7:tok7, 9:key9:tok:with:colons,broken");
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account_id, 7);
        assert_eq!(accounts[1].access_token, "tok:with:colons");
        assert!(accounts.iter().all(Account::is_active));
    }

    #[test]
    fn debug_hides_credentials() {
        let account = &Account::parse_list("1:secret-key:secret-token")[0];
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("secret"));
    }
}
