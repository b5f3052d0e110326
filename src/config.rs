//! # config — runtime configuration from environment variables
//!
//! `.env` is loaded by `main` (via `dotenvy`) before [`AppConfig::from_env`]
//! runs, so both sources work. Intervals, capacities and the spike window
//! are floored at 1; a zero would stall a channel or a timer.
//!
//! | Variable                        | Default          |
//! |---------------------------------|------------------|
//! | `BIND_ADDR`                     | `0.0.0.0:3000`   |
//! | `API_KEY`                       | empty (dev mode) |
//! | `FEED_WS_URL`                   | unset            |
//! | `FEED_SIMULATOR`                | `false`          |
//! | `FEED_SIMULATOR_INTERVAL_MS`    | `2000`           |
//! | `TOKEN_MAP`                     | empty            |
//! | `FEED_STALE_SECS`               | `10`             |
//! | `FEED_MAX_BACKOFF_SECS`         | `30`             |
//! | `BUS_CAPACITY`                  | `1024`           |
//! | `CLIENT_QUEUE_CAPACITY`         | `256`            |
//! | `ORDER_MONITOR_INTERVAL_SECS`   | `5`              |
//! | `SYNC_POSITIONS_INTERVAL_SECS`  | `300`            |
//! | `MARKET_UTC_OFFSET_MINUTES`     | `330` (IST)      |
//! | `SPIKE_THRESHOLD_PERCENT`       | `2.0`            |
//! | `SPIKE_WINDOW`                  | `15`             |
//! | `SPIKE_ACCOUNT_ID`              | first active     |
//! | `SPIKE_RESET_ON_NEW_SESSION`    | `false`          |
//! | `BROKER_BASE_URL`               | `mock`           |
//! | `DATABASE_URL`                  | unset            |
//! | `DEFAULT_AUTO_SELL_CUTOFF`      | `15:30`          |
//! | `ACCOUNTS`                      | empty            |

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{FixedOffset, NaiveTime};

use crate::models::{Account, SymbolMap};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// Empty → every request allowed.
    pub api_key:   String,

    // ── Feed ──────────────────────────────────────────────────────────────────
    /// Full upstream URL including credentials query.
    pub feed_ws_url:        Option<String>,
    pub feed_simulator:     bool,
    pub simulator_interval: Duration,
    pub symbols:            SymbolMap,
    pub feed_stale_after:   Duration,
    pub feed_max_backoff:   Duration,

    // ── Bus / fan-out ─────────────────────────────────────────────────────────
    pub bus_capacity:          usize,
    pub client_queue_capacity: usize,

    // ── Reactors ──────────────────────────────────────────────────────────────
    pub order_monitor_interval:  Duration,
    pub sync_positions_interval: Duration,
    pub market_offset:           FixedOffset,
    pub spike_threshold_percent: f64,
    pub spike_window:            usize,
    pub spike_account_id:        Option<i64>,
    pub spike_reset_on_new_session: bool,

    // ── Collaborators ─────────────────────────────────────────────────────────
    pub broker_base_url:          String,
    pub database_url:             Option<String>,
    pub default_auto_sell_cutoff: Option<NaiveTime>,
    pub accounts:                 Vec<Account>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = env_string("BIND_ADDR", "0.0.0.0:3000")
            .parse()
            .context("BIND_ADDR must be host:port")?;

        let offset_minutes = env_i32("MARKET_UTC_OFFSET_MINUTES", 330);
        let Some(market_offset) = FixedOffset::east_opt(offset_minutes * 60) else {
            bail!("MARKET_UTC_OFFSET_MINUTES out of range: {offset_minutes}");
        };

        let default_auto_sell_cutoff = match std::env::var("DEFAULT_AUTO_SELL_CUTOFF") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => Some(parse_cutoff(&raw)?),
            Err(_) => Some(NaiveTime::from_hms_opt(15, 30, 0).context("invalid default cutoff")?),
        };

        Ok(Self {
            bind_addr,
            api_key: env_string("API_KEY", ""),

            feed_ws_url:        feed_ws_url(),
            feed_simulator:     env_bool("FEED_SIMULATOR", false),
            simulator_interval: Duration::from_millis(env_u64("FEED_SIMULATOR_INTERVAL_MS", 2000).max(1)),
            symbols:            SymbolMap::parse(&env_string("TOKEN_MAP", "")),
            feed_stale_after:   Duration::from_secs(env_u64("FEED_STALE_SECS", 10).max(1)),
            feed_max_backoff:   Duration::from_secs(env_u64("FEED_MAX_BACKOFF_SECS", 30).max(1)),

            bus_capacity:          env_u64("BUS_CAPACITY", 1024).max(1) as usize,
            client_queue_capacity: env_u64("CLIENT_QUEUE_CAPACITY", 256).max(1) as usize,

            order_monitor_interval:  Duration::from_secs(env_u64("ORDER_MONITOR_INTERVAL_SECS", 5).max(1)),
            sync_positions_interval: Duration::from_secs(env_u64("SYNC_POSITIONS_INTERVAL_SECS", 300).max(1)),
            market_offset,
            spike_threshold_percent: env_f64("SPIKE_THRESHOLD_PERCENT", 2.0),
            spike_window:            env_u64("SPIKE_WINDOW", 15).max(1) as usize,
            spike_account_id:        std::env::var("SPIKE_ACCOUNT_ID").ok().and_then(|v| v.parse().ok()),
            spike_reset_on_new_session: env_bool("SPIKE_RESET_ON_NEW_SESSION", false),

            broker_base_url: env_string("BROKER_BASE_URL", "mock"),
            database_url:    std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            default_auto_sell_cutoff,
            accounts:        Account::parse_list(&env_string("ACCOUNTS", "")),
        })
    }
}

/// `FEED_WS_URL`, with `api_key` / `access_token` appended when
/// `FEED_API_KEY` and `FEED_ACCESS_TOKEN` are set.
fn feed_ws_url() -> Option<String> {
    let base = std::env::var("FEED_WS_URL").ok().filter(|v| !v.is_empty())?;
    match (std::env::var("FEED_API_KEY"), std::env::var("FEED_ACCESS_TOKEN")) {
        (Ok(key), Ok(token)) if !key.is_empty() && !token.is_empty() => {
            let sep = if base.contains('?') { '&' } else { '?' };
            Some(format!("{base}{sep}api_key={key}&access_token={token}"))
        }
        _ => Some(base),
    }
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_cutoff(raw: &str) -> anyhow::Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .with_context(|| format!("invalid cutoff time '{raw}', expected HH:MM"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_i32(key: &str, default: i32) -> i32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_accepts_both_formats() {
        assert_eq!(parse_cutoff("15:30").unwrap(), NaiveTime::from_hms_opt(15, 30, 0).unwrap());
        assert_eq!(parse_cutoff(" 09:15:30 ").unwrap(), NaiveTime::from_hms_opt(9, 15, 30).unwrap());
        assert!(parse_cutoff("3pm").is_err());
    }

    #[test]
    fn zero_intervals_and_capacities_are_floored() {
        for key in [
            "FEED_SIMULATOR_INTERVAL_MS",
            "FEED_STALE_SECS",
            "BUS_CAPACITY",
            "CLIENT_QUEUE_CAPACITY",
            "ORDER_MONITOR_INTERVAL_SECS",
            "SYNC_POSITIONS_INTERVAL_SECS",
            "SPIKE_WINDOW",
        ] {
            std::env::set_var(key, "0");
        }

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.simulator_interval, Duration::from_millis(1));
        assert_eq!(config.feed_stale_after, Duration::from_secs(1));
        assert_eq!(config.bus_capacity, 1);
        assert_eq!(config.client_queue_capacity, 1);
        assert_eq!(config.order_monitor_interval, Duration::from_secs(1));
        assert_eq!(config.sync_positions_interval, Duration::from_secs(1));
        assert_eq!(config.spike_window, 1);
    }
}
