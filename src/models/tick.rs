//! # models::tick
//!
//! Defines [`Tick`], the canonical market-state record every feed path
//! converges on, plus the [`SymbolMap`] used to give instrument tokens a
//! display name.
//!
//! A `Tick` is never mutated after the normalizer builds it. The tick store
//! hands out `Arc<Tick>` so every reader shares the same immutable snapshot;
//! an update for the same instrument is a brand-new `Tick` that supersedes the
//! previous one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Market Depth ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthSide {
    Bid,
    Ask,
}

/// One level of the order book as reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthEntry {
    pub side:        DepthSide,
    pub price:       f64,
    pub quantity:    i64,
    pub order_count: u32,
}

// ─── OHLC ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Ohlc {
    pub open:  f64,
    pub high:  f64,
    pub low:   f64,
    pub close: f64,
}

// ─── Tick ─────────────────────────────────────────────────────────────────────

/// One instrument's latest market state.
///
/// All prices are in currency units (rupees), never paise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Stable numeric instrument id; the store key.
    pub instrument_token: u32,

    /// Display name resolved through [`SymbolMap`].
    pub symbol: String,

    /// Last traded price.
    pub ltp: f64,

    pub last_quantity: i64,
    pub average_price: f64,
    pub volume:        i64,
    pub buy_quantity:  i64,
    pub sell_quantity: i64,
    pub ohlc:          Ohlc,

    // ── Open interest ─────────────────────────────────────────────────────────
    pub oi:          i64,
    pub oi_day_high: i64,
    pub oi_day_low:  i64,

    pub last_trade_time: DateTime<Utc>,
    pub exchange_time:   DateTime<Utc>,

    /// Up to 10 levels: first half bids, second half asks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_depth: Option<Vec<DepthEntry>>,
}

impl Tick {
    /// Minimal `{symbol, ltp}` view published to reactors.
    pub fn summary(&self) -> TickSummary {
        TickSummary {
            symbol: self.symbol.clone(),
            ltp:    self.ltp,
        }
    }
}

/// The minimal event shape reactors care about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub symbol: String,
    pub ltp:    f64,
}

// ─── Symbol Map ───────────────────────────────────────────────────────────────

/// Instrument token → display symbol, supplied from configuration.
///
/// Unknown tokens resolve to their decimal string so a tick is never dropped
/// just because nobody named it yet.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    by_token: HashMap<u32, String>,
}

impl SymbolMap {
    pub fn new(entries: impl IntoIterator<Item = (u32, String)>) -> Self {
        Self {
            by_token: entries.into_iter().collect(),
        }
    }

    /// Parses `"408065:INFY,884737:TATAMOTORS"`. Malformed pairs are skipped.
    pub fn parse(raw: &str) -> Self {
        let entries = raw
            .split(',')
            .filter_map(|pair| {
                let (token, symbol) = pair.trim().split_once(':')?;
                let token = token.trim().parse::<u32>().ok()?;
                let symbol = symbol.trim();
                (!symbol.is_empty()).then(|| (token, symbol.to_string()))
            });
        Self::new(entries)
    }

    pub fn resolve(&self, token: u32) -> String {
        self.by_token
            .get(&token)
            .cloned()
            .unwrap_or_else(|| token.to_string())
    }

    /// Tokens in ascending order (stable subscribe messages).
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.by_token.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_symbol_map_skips_garbage() {
        let map = SymbolMap::parse("408065:INFY, 884737:TATAMOTORS,bogus,12:");
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve(408065), "INFY");
        assert_eq!(map.resolve(884737), "TATAMOTORS");
        assert_eq!(map.tokens(), vec![408065, 884737]);
    }

    #[test]
    fn unknown_token_resolves_to_its_number() {
        let map = SymbolMap::default();
        assert_eq!(map.resolve(256265), "256265");
    }
}
