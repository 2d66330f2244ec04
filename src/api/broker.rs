//! Broker execution clients: a REST client for live/paper brokerage
//! accounts and an in-process simulator for dry runs and tests.
//!
//! The contract is deliberately narrow: submit a market order, read cash.
//! Stops and targets are never sent to the broker.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// Terminal-or-pending order state as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Filled,
    Rejected,
    Pending,
}

/// Result of an order submission.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub status: OrderStatus,
    pub fill_price: Option<Decimal>,
    pub order_id: Option<String>,
}

/// Broker execution contract.
pub trait Broker {
    /// Submit a market order. `reference_price` is the last observed price;
    /// the simulator fills against it and the live client uses it for its
    /// marketable limit guard.
    fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        reference_price: Decimal,
    ) -> impl std::future::Future<Output = EngineResult<OrderResult>> + Send;

    /// Current settled cash in the account.
    fn available_cash(&self) -> impl std::future::Future<Output = EngineResult<Decimal>> + Send;
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    qty: String,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    time_in_force: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    id: String,
    status: String,
    #[serde(default)]
    filled_avg_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct AccountRow {
    cash: Decimal,
}

/// REST brokerage client (Alpaca-style paper/live trading API).
pub struct HttpBroker {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,

    /// Marketable-limit guard width around the reference price
    slippage_guard: Decimal,

    /// How many times to poll an accepted order for its fill
    fill_polls: u32,
}

impl HttpBroker {
    /// Build from `BROKER_BASE_URL`, `BROKER_API_KEY`, `BROKER_API_SECRET`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("BROKER_BASE_URL")
            .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string());
        let api_key = std::env::var("BROKER_API_KEY").context("BROKER_API_KEY not set")?;
        let api_secret = std::env::var("BROKER_API_SECRET").context("BROKER_API_SECRET not set")?;

        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url,
            api_key,
            api_secret,
            slippage_guard: dec!(0.01),
            fill_polls: 5,
        })
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.api_secret)
    }

    fn map_status(status: &str) -> OrderStatus {
        match status {
            "filled" => OrderStatus::Filled,
            "rejected" | "canceled" | "expired" => OrderStatus::Rejected,
            _ => OrderStatus::Pending,
        }
    }

    async fn fetch_order(&self, order_id: &str) -> EngineResult<OrderRow> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let row = self
            .auth(self.http.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json::<OrderRow>()
            .await?;
        Ok(row)
    }
}

impl Broker for HttpBroker {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        reference_price: Decimal,
    ) -> EngineResult<OrderResult> {
        // Marketable limit: cross the spread but bound the fill
        let guard = match side {
            OrderSide::Buy => reference_price * (Decimal::ONE + self.slippage_guard),
            OrderSide::Sell => reference_price * (Decimal::ONE - self.slippage_guard),
        };

        let body = OrderRequest {
            symbol,
            qty: quantity.to_string(),
            side: side.as_str(),
            order_type: "limit",
            time_in_force: "day",
            limit_price: Some(guard.round_dp(2).to_string()),
        };

        let url = format!("{}/v2/orders", self.base_url);
        let response = self.auth(self.http.post(&url).json(&body)).send().await?;

        if response.status() == reqwest::StatusCode::FORBIDDEN
            || response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            let reason = response.text().await.unwrap_or_default();
            return Err(EngineError::OrderRejected(reason));
        }

        let mut row = response.error_for_status()?.json::<OrderRow>().await?;
        debug!(order_id = %row.id, status = %row.status, symbol, "Order submitted");

        // Market-hours fills land within a poll or two
        let mut polls = 0;
        while Self::map_status(&row.status) == OrderStatus::Pending && polls < self.fill_polls {
            tokio::time::sleep(Duration::from_millis(400)).await;
            row = self.fetch_order(&row.id).await?;
            polls += 1;
        }

        let status = Self::map_status(&row.status);
        if status == OrderStatus::Pending {
            warn!(order_id = %row.id, symbol, "Order still unfilled after polling");
        }

        Ok(OrderResult {
            status,
            fill_price: row.filled_avg_price,
            order_id: Some(row.id),
        })
    }

    async fn available_cash(&self) -> EngineResult<Decimal> {
        let url = format!("{}/v2/account", self.base_url);
        let account = self
            .auth(self.http.get(&url))
            .send()
            .await?
            .error_for_status()?
            .json::<AccountRow>()
            .await?;
        Ok(account.cash)
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// In-process broker for dry runs and tests: fills instantly at the
/// reference price plus configured slippage.
pub struct PaperBroker {
    cash: Mutex<Decimal>,
    slippage_pct: Decimal,
    order_seq: Mutex<u64>,
}

impl PaperBroker {
    pub fn new(starting_cash: Decimal, slippage_pct: Decimal) -> Self {
        Self {
            cash: Mutex::new(starting_cash),
            slippage_pct,
            order_seq: Mutex::new(0),
        }
    }
}

impl Broker for PaperBroker {
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u64,
        reference_price: Decimal,
    ) -> EngineResult<OrderResult> {
        if quantity == 0 {
            return Err(EngineError::OrderRejected("zero quantity".to_string()));
        }

        // Slippage works against the taker on both sides
        let fill_price = match side {
            OrderSide::Buy => reference_price * (Decimal::ONE + self.slippage_pct),
            OrderSide::Sell => reference_price * (Decimal::ONE - self.slippage_pct),
        };
        let notional = fill_price * Decimal::from(quantity);

        let mut cash = self.cash.lock().expect("paper broker cash lock");
        match side {
            OrderSide::Buy => {
                if notional > *cash {
                    return Ok(OrderResult {
                        status: OrderStatus::Rejected,
                        fill_price: None,
                        order_id: None,
                    });
                }
                *cash -= notional;
            }
            OrderSide::Sell => *cash += notional,
        }

        let mut seq = self.order_seq.lock().expect("paper broker seq lock");
        *seq += 1;

        debug!(symbol, side = side.as_str(), quantity, fill = %fill_price, "[PAPER] Order filled");

        Ok(OrderResult {
            status: OrderStatus::Filled,
            fill_price: Some(fill_price),
            order_id: Some(format!("paper-{}", *seq)),
        })
    }

    async fn available_cash(&self) -> EngineResult<Decimal> {
        Ok(*self.cash.lock().expect("paper broker cash lock"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paper_fill_applies_slippage() {
        let broker = PaperBroker::new(dec!(10000), dec!(0.001));

        let result = broker
            .place_order("AAPL", OrderSide::Buy, 10, dec!(100))
            .await
            .unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.fill_price, Some(dec!(100.1)));
        // 10 shares at 100.10
        assert_eq!(broker.available_cash().await.unwrap(), dec!(8999));
    }

    #[tokio::test]
    async fn test_paper_rejects_on_insufficient_cash() {
        let broker = PaperBroker::new(dec!(100), Decimal::ZERO);

        let result = broker
            .place_order("AAPL", OrderSide::Buy, 10, dec!(100))
            .await
            .unwrap();

        assert_eq!(result.status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_paper_sell_credits_cash() {
        let broker = PaperBroker::new(dec!(1000), Decimal::ZERO);

        broker
            .place_order("AAPL", OrderSide::Sell, 5, dec!(50))
            .await
            .unwrap();

        assert_eq!(broker.available_cash().await.unwrap(), dec!(1250));
    }
}
