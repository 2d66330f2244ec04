//! Market data clients: batched per-tick snapshots for the monitor.
//!
//! A symbol that fails to fetch is simply absent from the returned map;
//! the monitor holds that position over to the next tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::errors::{EngineError, EngineResult};
use crate::models::MarketSnapshot;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Market data contract: one batched snapshot fetch per tick.
pub trait MarketData {
    fn snapshots(
        &self,
        symbols: &[String],
    ) -> impl std::future::Future<Output = EngineResult<HashMap<String, MarketSnapshot>>> + Send;
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct QuoteRow {
    price: Decimal,
    volume: u64,
    #[serde(default = "default_ratio")]
    volume_ratio: f64,
    #[serde(default = "default_momentum")]
    momentum: f64,
    #[serde(default)]
    volatility: f64,
    #[serde(rename = "timestamp")]
    as_of: DateTime<Utc>,
}

fn default_ratio() -> f64 {
    1.0
}

fn default_momentum() -> f64 {
    50.0
}

/// REST quote/indicator client.
pub struct HttpMarketData {
    http: Client,
    base_url: String,
}

impl HttpMarketData {
    /// Build from `MARKET_DATA_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("MARKET_DATA_BASE_URL").context("MARKET_DATA_BASE_URL not set")?;
        Self::with_base_url(base_url)
    }

    pub fn with_base_url(base_url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, base_url })
    }

    async fn fetch_one(&self, symbol: &str) -> EngineResult<MarketSnapshot> {
        let unavailable = |e: reqwest::Error| EngineError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: e.to_string(),
        };

        let url = format!("{}/v1/snapshot/{}", self.base_url, symbol);
        let row = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(unavailable)?
            .error_for_status()
            .map_err(unavailable)?
            .json::<QuoteRow>()
            .await
            .map_err(unavailable)?;

        Ok(MarketSnapshot {
            symbol: symbol.to_string(),
            price: row.price,
            volume: row.volume,
            volume_ratio: row.volume_ratio,
            momentum: row.momentum,
            volatility: row.volatility,
            as_of: row.as_of,
        })
    }
}

impl MarketData for HttpMarketData {
    async fn snapshots(
        &self,
        symbols: &[String],
    ) -> EngineResult<HashMap<String, MarketSnapshot>> {
        // Fetch concurrently; results are applied serially by the caller
        let fetches = symbols.iter().map(|s| self.fetch_one(s));
        let results = join_all(fetches).await;

        let mut map = HashMap::new();
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(snapshot) => {
                    map.insert(symbol.clone(), snapshot);
                }
                Err(e) => {
                    // Not fatal to the batch; the position is held over
                    warn!(symbol = %symbol, error = %e, "Snapshot unavailable");
                }
            }
        }

        Ok(map)
    }
}

// ---------------------------------------------------------------------------
// Scripted feed
// ---------------------------------------------------------------------------

/// In-memory feed that replays pre-scripted ticks; for dry runs and tests.
pub struct ScriptedFeed {
    ticks: Mutex<Vec<HashMap<String, MarketSnapshot>>>,
}

impl ScriptedFeed {
    pub fn new(ticks: Vec<HashMap<String, MarketSnapshot>>) -> Self {
        Self {
            ticks: Mutex::new(ticks),
        }
    }

    /// Build a single-symbol feed from a list of snapshots.
    pub fn for_symbol(symbol: &str, snapshots: Vec<MarketSnapshot>) -> Self {
        let ticks = snapshots
            .into_iter()
            .map(|s| HashMap::from([(symbol.to_string(), s)]))
            .collect();
        Self::new(ticks)
    }
}

impl MarketData for ScriptedFeed {
    async fn snapshots(
        &self,
        symbols: &[String],
    ) -> EngineResult<HashMap<String, MarketSnapshot>> {
        let mut ticks = self.ticks.lock().expect("scripted feed lock");
        if ticks.is_empty() {
            return Ok(HashMap::new());
        }
        let mut tick = ticks.remove(0);
        tick.retain(|symbol, _| symbols.contains(symbol));
        Ok(tick)
    }
}
