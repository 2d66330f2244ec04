//! Market snapshot model: one symbol's per-tick quote and indicator bundle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A point-in-time view of one symbol, fetched in a batch once per tick.
///
/// Indicator fields are provider-computed; the exit engine never reaches
/// back into price history, so everything it needs must ride on the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,

    /// Last trade price
    pub price: Decimal,

    /// Share volume over the provider's rolling window
    pub volume: u64,

    /// Current volume relative to the recent average (1.0 = average)
    pub volume_ratio: f64,

    /// Momentum oscillator reading, 0-100 scale
    pub momentum: f64,

    /// Intraday realized volatility, as a fraction of price
    pub volatility: f64,

    /// Provider timestamp for this snapshot
    pub as_of: DateTime<Utc>,
}

impl MarketSnapshot {
    /// Volume is surging relative to the recent average.
    pub fn volume_surge(&self, surge_ratio: f64) -> bool {
        self.volume_ratio >= surge_ratio
    }
}
