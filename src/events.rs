//! # events
//!
//! Everything pushed to WebSocket clients besides raw ticks.
//!
//! [`OrderEvent`] covers the order lifecycle (`/ws/orders`); [`LiveEvent`]
//! carries feed health and delivery gaps. Both are serialized once to JSON and
//! shared as `Arc<str>` so fan-out never clones a payload per client.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::OrderStatus;

/// Order-lifecycle events emitted by the reactors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEvent {
    /// Spike detected, buy about to be sent.
    SpikeBuyFired {
        symbol:        String,
        ltp:           f64,
        average:       f64,
        spike_percent: f64,
    },

    SpikeBuyPlaced {
        account_id: i64,
        symbol:     String,
        order_id:   String,
    },

    SpikeBuyFailed {
        symbol: String,
        error:  String,
    },

    /// First cycle at or after the configured cutoff for this session.
    CutoffReached {
        account_id: i64,
        session:    NaiveDate,
        cutoff:     NaiveTime,
    },

    AutoSellPlaced {
        account_id: i64,
        symbol:     String,
        quantity:   i64,
        order_id:   String,
    },

    AutoSellFailed {
        account_id: i64,
        symbol:     String,
        quantity:   i64,
        error:      String,
    },

    OrderStatusChanged {
        order_id:   i64,
        account_id: i64,
        symbol:     String,
        status:     OrderStatus,
    },

    SessionSettled {
        account_id: i64,
        session:    NaiveDate,
    },
}

/// Transport notices interleaved with the payload stream: feed health on
/// `/ws/ticks`, delivery gaps on either stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiveEvent {
    FeedUnavailable {
        last_tick_at: Option<DateTime<Utc>>,
        stale_secs:   u64,
    },
    FeedRestored {
        last_tick_at: DateTime<Utc>,
    },
    /// This client's queue overflowed; `dropped` messages never reached it.
    Gap {
        dropped: u64,
    },
}

impl OrderEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

impl LiveEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

// ─── Publisher ────────────────────────────────────────────────────────────────

/// Sending half of the order-event topic; cloned into every reactor.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Arc<str>>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget: no listeners is not an error.
    pub fn publish(&self, event: &OrderEvent) {
        let json: Arc<str> = event.to_json().into();
        if self.tx.send(json).is_err() {
            debug!(?event, "order event had no listeners");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_events_are_tagged() {
        let json = OrderEvent::OrderStatusChanged {
            order_id:   42,
            account_id: 1,
            symbol:     "INFY".into(),
            status:     OrderStatus::AutoSold,
        }
        .to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["event"], "ORDER_STATUS_CHANGED");
        assert_eq!(value["status"], "auto_sold");
    }

    #[test]
    fn feed_events_are_tagged() {
        let json = LiveEvent::FeedUnavailable { last_tick_at: None, stale_secs: 10 }.to_json();
        assert_eq!(json, r#"{"event":"FEED_UNAVAILABLE","last_tick_at":null,"stale_secs":10}"#);
        assert_eq!(LiveEvent::Gap { dropped: 3 }.to_json(), r#"{"event":"GAP","dropped":3}"#);
    }

    #[tokio::test]
    async fn publisher_delivers_to_subscribers() {
        let events = EventPublisher::new(8);
        let mut rx = events.subscribe();
        events.publish(&OrderEvent::SessionSettled {
            account_id: 1,
            session:    NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
        });
        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("SESSION_SETTLED"));
        assert!(msg.contains("2024-06-10"));
    }
}
