//! # engine::executor
//!
//! **Order Executor** — the broker seam both reactors place orders through.
//!
//! ## Kite Connect contract
//! `POST {base}/orders/regular` (form body) returns:
//! ```json
//! { "status": "success", "data": { "order_id": "151220000000000" } }
//! ```
//! `GET {base}/portfolio/positions` returns `data.net[]` rows. Any
//! `"status": "error"` body is a rejection.
//!
//! `BROKER_BASE_URL=mock` swaps in [`PaperBroker`], which fills instantly at
//! the latest bus price.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bus::TickBus;
use crate::error::AppError;
use crate::models::Account;

// ─── Order Request / Response ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy  => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// A market order on NSE, intraday (MIS) product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol:     String,
    pub side:       OrderSide,
    pub quantity:   i64,
    pub order_type: &'static str, // "MARKET"
    pub product:    &'static str, // "MIS"
    pub exchange:   &'static str, // "NSE"
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: i64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: "MARKET",
            product:    "MIS",
            exchange:   "NSE",
        }
    }
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
}

/// One row of the broker's net position book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    #[serde(rename = "tradingsymbol")]
    pub symbol:        String,
    pub quantity:      i64,
    #[serde(default)]
    pub average_price: f64,
    #[serde(default)]
    pub pnl:           f64,
}

// ─── Broker Trait ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait Broker: Send + Sync {
    async fn place_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderAck, AppError>;

    async fn positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, AppError>;
}

/// `"mock"` → [`PaperBroker`], anything else is a Kite-compatible base URL.
pub fn build_broker(base_url: &str, bus: Arc<TickBus>) -> Arc<dyn Broker> {
    if base_url == "mock" {
        info!("🎭 [EXECUTOR] Running in MOCK mode — paper broker fills at bus price");
        Arc::new(PaperBroker::new(bus))
    } else {
        info!(broker_url = %base_url, "🏦 [EXECUTOR] Using Kite broker");
        Arc::new(KiteBroker::new(base_url))
    }
}

// ─── Kite Broker ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct KiteEnvelope<T> {
    status:  String,
    data:    Option<T>,
    message: Option<String>,
}

impl<T> KiteEnvelope<T> {
    fn into_data(self) -> Result<T, AppError> {
        match (self.status.as_str(), self.data) {
            ("success", Some(data)) => Ok(data),
            _ => Err(AppError::BrokerCallFailed(format!(
                "broker rejected: {}",
                self.message.as_deref().unwrap_or("unknown")
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct KitePositions {
    net: Vec<BrokerPosition>,
}

pub struct KiteBroker {
    client:   reqwest::Client,
    base_url: String,
}

impl KiteBroker {
    pub fn new(base_url: &str) -> Self {
        Self {
            client:   reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder, account: &Account) -> reqwest::RequestBuilder {
        request
            .header("X-Kite-Version", "3")
            .header(
                "Authorization",
                format!("token {}:{}", account.api_key, account.access_token),
            )
            .timeout(Duration::from_secs(5)) // never wait longer than 5s
    }

    async fn read_envelope<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AppError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            error!(error = %e, "Broker response read failed");
            AppError::BrokerCallFailed(format!("broker response read error: {e}"))
        })?;

        let envelope: KiteEnvelope<T> = serde_json::from_str(&body).map_err(|e| {
            error!(http_status = %status, body = %body, "Broker response parse failed");
            AppError::BrokerCallFailed(format!("broker HTTP {status}: {e}"))
        })?;
        envelope.into_data()
    }
}

#[async_trait]
impl Broker for KiteBroker {
    async fn place_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderAck, AppError> {
        let url = format!("{}/orders/regular", self.base_url);
        info!(
            account_id = account.account_id,
            symbol     = %order.symbol,
            side       = order.side.as_str(),
            quantity   = order.quantity,
            "🚀 [EXECUTOR] Sending order to broker"
        );

        let quantity = order.quantity.to_string();
        let form = [
            ("tradingsymbol",    order.symbol.as_str()),
            ("exchange",         order.exchange),
            ("transaction_type", order.side.as_str()),
            ("order_type",       order.order_type),
            ("quantity",         quantity.as_str()),
            ("product",          order.product),
            ("validity",         "DAY"),
        ];

        let response = self
            .authorize(self.client.post(&url), account)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Broker unreachable");
                AppError::BrokerCallFailed(format!("broker unreachable: {e}"))
            })?;

        let ack: OrderAck = Self::read_envelope(response).await.map_err(|e| {
            warn!(symbol = %order.symbol, error = %e, "Broker rejected order");
            e
        })?;

        info!(order_id = %ack.order_id, "✅ [EXECUTOR] Broker accepted order");
        Ok(ack)
    }

    async fn positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, AppError> {
        let url = format!("{}/portfolio/positions", self.base_url);
        let response = self
            .authorize(self.client.get(&url), account)
            .send()
            .await
            .map_err(|e| AppError::BrokerCallFailed(format!("broker unreachable: {e}")))?;

        let positions: KitePositions = Self::read_envelope(response).await?;
        Ok(positions.net)
    }
}

// ─── Paper Broker ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct PaperHolding {
    quantity:  i64,
    avg_price: f64,
}

/// In-memory broker: instant fills at the latest published price.
pub struct PaperBroker {
    bus:      Arc<TickBus>,
    holdings: RwLock<HashMap<(i64, String), PaperHolding>>,
    fills:    RwLock<u64>,
    #[cfg(test)]
    rejected: RwLock<std::collections::HashSet<String>>,
}

impl PaperBroker {
    pub fn new(bus: Arc<TickBus>) -> Self {
        Self {
            bus,
            holdings: RwLock::new(HashMap::new()),
            fills:    RwLock::new(0),
            #[cfg(test)]
            rejected: RwLock::new(Default::default()),
        }
    }

    /// Every subsequent order for `symbol` fails with `BrokerCallFailed`.
    #[cfg(test)]
    pub async fn reject(&self, symbol: &str) {
        self.rejected.write().await.insert(symbol.to_string());
    }

    #[cfg(test)]
    pub async fn seed(&self, account_id: i64, symbol: &str, quantity: i64, avg_price: f64) {
        self.holdings
            .write()
            .await
            .insert((account_id, symbol.to_string()), PaperHolding { quantity, avg_price });
    }

    #[cfg(test)]
    pub async fn fill_count(&self) -> u64 {
        *self.fills.read().await
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, account: &Account, order: &OrderRequest) -> Result<OrderAck, AppError> {
        #[cfg(test)]
        {
            if self.rejected.read().await.contains(&order.symbol) {
                return Err(AppError::BrokerCallFailed(format!("paper broker rejected {}", order.symbol)));
            }
        }

        if order.quantity <= 0 {
            return Err(AppError::BrokerCallFailed(format!(
                "invalid quantity {} for {}",
                order.quantity, order.symbol
            )));
        }

        let price = self
            .bus
            .latest_by_symbol(&order.symbol)
            .await
            .map(|tick| tick.ltp)
            .unwrap_or_default();

        let mut holdings = self.holdings.write().await;
        let holding = holdings
            .entry((account.account_id, order.symbol.clone()))
            .or_default();
        match order.side {
            OrderSide::Buy => {
                let cost = holding.avg_price * holding.quantity as f64 + price * order.quantity as f64;
                holding.quantity += order.quantity;
                holding.avg_price = cost / holding.quantity as f64;
            }
            OrderSide::Sell => holding.quantity -= order.quantity,
        }

        let mut fills = self.fills.write().await;
        *fills += 1;
        let ack = OrderAck { order_id: format!("PAPER-{:06}", *fills) };

        info!(
            account_id = account.account_id,
            symbol     = %order.symbol,
            side       = order.side.as_str(),
            quantity   = order.quantity,
            price,
            order_id   = %ack.order_id,
            "🎭 [EXECUTOR] Paper fill"
        );
        Ok(ack)
    }

    async fn positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, AppError> {
        let holdings = self.holdings.read().await;
        let mut rows = Vec::new();
        for ((account_id, symbol), holding) in holdings.iter() {
            if *account_id != account.account_id {
                continue;
            }
            let pnl = match self.bus.latest_by_symbol(symbol).await {
                Ok(tick) => (tick.ltp - holding.avg_price) * holding.quantity as f64,
                Err(_) => 0.0,
            };
            rows.push(BrokerPosition {
                symbol:        symbol.clone(),
                quantity:      holding.quantity,
                average_price: holding.avg_price,
                pnl,
            });
        }
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::tick;

    fn account() -> Account {
        Account::parse_list("7:key:token").remove(0)
    }

    #[tokio::test]
    async fn paper_buy_then_sell_flattens() {
        let bus = Arc::new(TickBus::new(8));
        bus.publish(tick(408065, "INFY", 1500.0)).await;
        let broker = PaperBroker::new(bus.clone());

        broker
            .place_order(&account(), &OrderRequest::market("INFY", OrderSide::Buy, 2))
            .await
            .unwrap();
        let book = broker.positions(&account()).await.unwrap();
        assert_eq!(book[0].quantity, 2);
        assert_eq!(book[0].average_price, 1500.0);

        bus.publish(tick(408065, "INFY", 1510.0)).await;
        assert_eq!(broker.positions(&account()).await.unwrap()[0].pnl, 20.0);

        let ack = broker
            .place_order(&account(), &OrderRequest::market("INFY", OrderSide::Sell, 2))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "PAPER-000002");
        assert_eq!(broker.positions(&account()).await.unwrap()[0].quantity, 0);
    }

    #[tokio::test]
    async fn rejected_symbol_fails_without_fill() {
        let broker = PaperBroker::new(Arc::new(TickBus::new(8)));
        broker.reject("INFY").await;

        let result = broker
            .place_order(&account(), &OrderRequest::market("INFY", OrderSide::Buy, 1))
            .await;
        assert!(matches!(result, Err(AppError::BrokerCallFailed(_))));
        assert_eq!(broker.fill_count().await, 0);
    }

    #[test]
    fn kite_error_envelope_is_a_rejection() {
        let body = r#"{"status":"error","message":"Insufficient funds","error_type":"MarginException"}"#;
        let envelope: KiteEnvelope<OrderAck> = serde_json::from_str(body).unwrap();
        match envelope.into_data() {
            Err(AppError::BrokerCallFailed(msg)) => assert!(msg.contains("Insufficient funds")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn kite_positions_parse_net_book() {
        let body = r#"{"status":"success","data":{"net":[
            {"tradingsymbol":"INFY","exchange":"NSE","quantity":3,"average_price":1500.5,"pnl":12.0},
            {"tradingsymbol":"TCS","exchange":"NSE","quantity":0,"average_price":0,"pnl":-4.5}
        ],"day":[]}}"#;
        let envelope: KiteEnvelope<KitePositions> = serde_json::from_str(body).unwrap();
        let net = envelope.into_data().unwrap().net;
        assert_eq!(net.len(), 2);
        assert_eq!(net[0].symbol, "INFY");
        assert_eq!(net[0].quantity, 3);
        assert_eq!(net[1].pnl, -4.5);
    }
}
