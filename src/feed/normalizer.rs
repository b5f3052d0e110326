//! # feed::normalizer
//!
//! **Tick Normalizer** — pure transform from a raw feed payload to a [`Tick`].
//!
//! ## Binary quote frame (all fields big-endian)
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────────────────────
//!      0  17×4  i32 header: token, ltp, last qty, avg price, volume,
//!               buy qty, sell qty, open, high, low, close,
//!               last trade time, oi, oi day high, oi day low,
//!               exchange time, reserved
//!     68  k×12  depth: i32 qty, i32 price, u16 orders, 2 pad
//!               (k ∈ {0, 2, .., 10}; first half bids, second half asks)
//! ```
//! Prices on the wire are paise and are divided by 100. Vendor callback
//! payloads already carry decimal prices and pass through unchanged.
//!
//! No I/O, no retries: a malformed frame is a [`DecodeError`] and the caller
//! drops it.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::models::{DepthEntry, DepthSide, Ohlc, SymbolMap, Tick};

pub const HEADER_FIELDS: usize = 17;
pub const HEADER_LEN: usize = HEADER_FIELDS * 4;
pub const DEPTH_ENTRY_LEN: usize = 12;
pub const MAX_DEPTH_ENTRIES: usize = 10;

const PAISE_PER_UNIT: f64 = 100.0;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, header needs 68")]
    TooShort { len: usize },

    #[error("frame length {len} is not a header plus whole 12-byte depth entries")]
    BadLength { len: usize },

    #[error("{count} depth entries exceeds the maximum of 10")]
    TooManyDepthEntries { count: usize },

    #[error("{count} depth entries cannot be split into bid and ask halves")]
    UnbalancedDepth { count: usize },

    #[error("instrument token {0} out of range")]
    InvalidToken(i64),

    #[error("{field} timestamp {value} out of range")]
    InvalidTimestamp { field: &'static str, value: i64 },

    #[error("{field} price {value} is not a valid price")]
    InvalidPrice { field: &'static str, value: f64 },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("malformed packet envelope: {0}")]
    BadEnvelope(String),
}

// ─── Raw Inputs ───────────────────────────────────────────────────────────────

/// Anything a feed source can hand to the ingest loop.
#[derive(Debug, Clone)]
pub enum RawFrame {
    /// One fixed-layout binary quote packet.
    Binary(Vec<u8>),
    /// A structured tick from a vendor push callback.
    Vendor(VendorTick),
}

/// Vendor callback payload (decimal prices).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VendorTick {
    pub instrument_token: i64,
    pub last_price:       f64,
    #[serde(default)]
    pub last_traded_quantity: i64,
    #[serde(default)]
    pub average_traded_price: f64,
    #[serde(default)]
    pub volume_traded: i64,
    #[serde(default)]
    pub total_buy_quantity: i64,
    #[serde(default)]
    pub total_sell_quantity: i64,
    #[serde(default)]
    pub ohlc: Ohlc,
    #[serde(default)]
    pub oi: i64,
    #[serde(default)]
    pub oi_day_high: i64,
    #[serde(default)]
    pub oi_day_low: i64,
    /// Falls back to `exchange_timestamp` when absent.
    #[serde(default)]
    pub last_trade_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exchange_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depth: Option<VendorDepth>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct VendorDepth {
    #[serde(default)]
    pub buy:  Vec<VendorLevel>,
    #[serde(default)]
    pub sell: Vec<VendorLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct VendorLevel {
    pub price:    f64,
    pub quantity: i64,
    #[serde(default)]
    pub orders:   u32,
}

// ─── Normalize ────────────────────────────────────────────────────────────────

/// Decodes either feed shape into the canonical [`Tick`].
pub fn normalize(raw: &RawFrame, symbols: &SymbolMap) -> Result<Tick, DecodeError> {
    match raw {
        RawFrame::Binary(bytes) => decode_binary(bytes, symbols),
        RawFrame::Vendor(tick) => decode_vendor(tick, symbols),
    }
}

fn decode_binary(bytes: &[u8], symbols: &SymbolMap) -> Result<Tick, DecodeError> {
    let len = bytes.len();
    if len < HEADER_LEN {
        return Err(DecodeError::TooShort { len });
    }
    let depth_bytes = len - HEADER_LEN;
    if depth_bytes % DEPTH_ENTRY_LEN != 0 {
        return Err(DecodeError::BadLength { len });
    }
    let depth_count = depth_bytes / DEPTH_ENTRY_LEN;
    if depth_count > MAX_DEPTH_ENTRIES {
        return Err(DecodeError::TooManyDepthEntries { count: depth_count });
    }
    if depth_count % 2 != 0 {
        return Err(DecodeError::UnbalancedDepth { count: depth_count });
    }

    let mut header = [0i32; HEADER_FIELDS];
    for (i, field) in header.iter_mut().enumerate() {
        *field = read_i32(bytes, i * 4);
    }

    let token = header[0];
    if token <= 0 {
        return Err(DecodeError::InvalidToken(token.into()));
    }
    let token = token as u32;

    let market_depth = (depth_count > 0)
        .then(|| {
            (0..depth_count)
                .map(|i| {
                    let offset = HEADER_LEN + i * DEPTH_ENTRY_LEN;
                    Ok(DepthEntry {
                        side:        if i < depth_count / 2 { DepthSide::Bid } else { DepthSide::Ask },
                        quantity:    read_i32(bytes, offset).into(),
                        price:       paise("depth", read_i32(bytes, offset + 4))?,
                        order_count: read_u16(bytes, offset + 8).into(),
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()
        })
        .transpose()?;

    Ok(Tick {
        instrument_token: token,
        symbol:           symbols.resolve(token),
        ltp:              paise("ltp", header[1])?,
        last_quantity:    header[2].into(),
        average_price:    paise("average_price", header[3])?,
        volume:           header[4].into(),
        buy_quantity:     header[5].into(),
        sell_quantity:    header[6].into(),
        ohlc: Ohlc {
            open:  paise("open", header[7])?,
            high:  paise("high", header[8])?,
            low:   paise("low", header[9])?,
            close: paise("close", header[10])?,
        },
        last_trade_time:  unix_seconds("last_trade_time", header[11].into())?,
        oi:               header[12].into(),
        oi_day_high:      header[13].into(),
        oi_day_low:       header[14].into(),
        exchange_time:    unix_seconds("exchange_time", header[15].into())?,
        market_depth,
    })
}

fn decode_vendor(raw: &VendorTick, symbols: &SymbolMap) -> Result<Tick, DecodeError> {
    let token = u32::try_from(raw.instrument_token)
        .ok()
        .filter(|t| *t > 0)
        .ok_or(DecodeError::InvalidToken(raw.instrument_token))?;

    let exchange_time = raw
        .exchange_timestamp
        .ok_or(DecodeError::MissingField("exchange_timestamp"))?;

    let market_depth = match &raw.depth {
        Some(depth) if !(depth.buy.is_empty() && depth.sell.is_empty()) => {
            let count = depth.buy.len() + depth.sell.len();
            if count > MAX_DEPTH_ENTRIES {
                return Err(DecodeError::TooManyDepthEntries { count });
            }
            let bids = depth.buy.iter().map(|l| (DepthSide::Bid, l));
            let asks = depth.sell.iter().map(|l| (DepthSide::Ask, l));
            let entries = bids
                .chain(asks)
                .map(|(side, level)| {
                    Ok(DepthEntry {
                        side,
                        price:       decimal("depth", level.price)?,
                        quantity:    level.quantity,
                        order_count: level.orders,
                    })
                })
                .collect::<Result<Vec<_>, DecodeError>>()?;
            Some(entries)
        }
        _ => None,
    };

    Ok(Tick {
        instrument_token: token,
        symbol:           symbols.resolve(token),
        ltp:              decimal("ltp", raw.last_price)?,
        last_quantity:    raw.last_traded_quantity,
        average_price:    decimal("average_price", raw.average_traded_price)?,
        volume:           raw.volume_traded,
        buy_quantity:     raw.total_buy_quantity,
        sell_quantity:    raw.total_sell_quantity,
        ohlc: Ohlc {
            open:  decimal("open", raw.ohlc.open)?,
            high:  decimal("high", raw.ohlc.high)?,
            low:   decimal("low", raw.ohlc.low)?,
            close: decimal("close", raw.ohlc.close)?,
        },
        oi:               raw.oi,
        oi_day_high:      raw.oi_day_high,
        oi_day_low:       raw.oi_day_low,
        last_trade_time:  raw.last_trade_time.unwrap_or(exchange_time),
        exchange_time,
        market_depth,
    })
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// Splits a vendor binary message into its quote packets.
///
/// Layout: `u16 count`, then `count × (u16 len, len bytes)`. Messages shorter
/// than two bytes are heartbeats and carry no packets.
pub fn split_packets(message: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    if message.len() < 2 {
        return Ok(Vec::new());
    }

    let count = read_u16(message, 0) as usize;
    let mut packets = Vec::with_capacity(count);
    let mut offset = 2;

    for index in 0..count {
        if offset + 2 > message.len() {
            return Err(DecodeError::BadEnvelope(format!(
                "packet {index} length prefix truncated"
            )));
        }
        let len = read_u16(message, offset) as usize;
        offset += 2;

        let end = offset + len;
        if end > message.len() {
            return Err(DecodeError::BadEnvelope(format!(
                "packet {index} declares {len} bytes, {} remain",
                message.len() - offset
            )));
        }
        packets.push(&message[offset..end]);
        offset = end;
    }

    Ok(packets)
}

// ─── Encoder ──────────────────────────────────────────────────────────────────

/// One depth level in wire units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireDepthLevel {
    pub quantity:    i32,
    pub price_paise: i32,
    pub orders:      u16,
}

/// Wire-level quote packet; the inverse of the binary decoder.
///
/// Used by the simulated feed to produce realistic frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuoteFrame {
    pub token:           i32,
    pub ltp_paise:       i32,
    pub last_quantity:   i32,
    pub average_paise:   i32,
    pub volume:          i32,
    pub buy_quantity:    i32,
    pub sell_quantity:   i32,
    pub open_paise:      i32,
    pub high_paise:      i32,
    pub low_paise:       i32,
    pub close_paise:     i32,
    pub last_trade_time: i32,
    pub oi:              i32,
    pub oi_day_high:     i32,
    pub oi_day_low:      i32,
    pub exchange_time:   i32,
    pub depth:           Vec<WireDepthLevel>,
}

impl QuoteFrame {
    pub fn encode(&self) -> Vec<u8> {
        let header: [i32; HEADER_FIELDS] = [
            self.token,
            self.ltp_paise,
            self.last_quantity,
            self.average_paise,
            self.volume,
            self.buy_quantity,
            self.sell_quantity,
            self.open_paise,
            self.high_paise,
            self.low_paise,
            self.close_paise,
            self.last_trade_time,
            self.oi,
            self.oi_day_high,
            self.oi_day_low,
            self.exchange_time,
            self.exchange_time, // reserved slot mirrors exchange time
        ];

        let mut out = Vec::with_capacity(HEADER_LEN + self.depth.len() * DEPTH_ENTRY_LEN);
        for field in header {
            out.extend_from_slice(&field.to_be_bytes());
        }
        for level in &self.depth {
            out.extend_from_slice(&level.quantity.to_be_bytes());
            out.extend_from_slice(&level.price_paise.to_be_bytes());
            out.extend_from_slice(&level.orders.to_be_bytes());
            out.extend_from_slice(&[0, 0]);
        }
        out
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

// Callers validate lengths before reading.
fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_be_bytes(raw)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_be_bytes(raw)
}

fn paise(field: &'static str, value: i32) -> Result<f64, DecodeError> {
    decimal(field, f64::from(value) / PAISE_PER_UNIT)
}

fn decimal(field: &'static str, value: f64) -> Result<f64, DecodeError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(DecodeError::InvalidPrice { field, value })
    }
}

fn unix_seconds(field: &'static str, value: i64) -> Result<DateTime<Utc>, DecodeError> {
    if value <= 0 {
        return Err(DecodeError::InvalidTimestamp { field, value });
    }
    DateTime::from_timestamp(value, 0).ok_or(DecodeError::InvalidTimestamp { field, value })
}

// ─── Tests ────────────────────────────────────────────────────────────────────
