//! Trade signal models: the sizing request produced by upstream strategies
//! and the sizing result the trade manager acts on.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How many independent strategies concur on the same trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgreementLevel {
    None,
    Low,
    Medium,
    High,
    Maximum,
}

impl std::str::FromStr for AgreementLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(AgreementLevel::None),
            "LOW" => Ok(AgreementLevel::Low),
            "MEDIUM" => Ok(AgreementLevel::Medium),
            "HIGH" => Ok(AgreementLevel::High),
            "MAXIMUM" => Ok(AgreementLevel::Maximum),
            other => Err(format!("unknown agreement level: {other}")),
        }
    }
}

impl AgreementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementLevel::None => "NONE",
            AgreementLevel::Low => "LOW",
            AgreementLevel::Medium => "MEDIUM",
            AgreementLevel::High => "HIGH",
            AgreementLevel::Maximum => "MAXIMUM",
        }
    }
}

/// An entry signal from an upstream strategy. The core treats signal quality
/// as opaque; only the numeric fields are validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Ticker symbol, e.g. "AAPL"
    pub symbol: String,

    /// Signal confidence in [0, 1]
    pub confidence: f64,

    /// Cross-strategy agreement on this trade
    pub agreement: AgreementLevel,

    /// Reference entry price at signal time
    pub entry_price: Decimal,

    /// Which strategy produced the signal (keys the per-strategy cap)
    #[serde(default)]
    pub strategy: Option<String>,

    /// When the signal was generated
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
}

/// Why a sizing request produced no position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingRejection {
    /// No trading capital is available.
    NoCapital,
    /// The capped target value fell below the configured minimum.
    BelowMinimum,
    /// The target value buys less than one whole share.
    ZeroQuantity,
}

impl SizingRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizingRejection::NoCapital => "no trading capital available",
            SizingRejection::BelowMinimum => "target value below minimum position value",
            SizingRejection::ZeroQuantity => "target value buys zero whole shares",
        }
    }
}

/// Output of the position sizer. Rejections are values, not errors, so the
/// trade manager reacts to them without special-casing failure paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizingResult {
    /// Final dollar value to deploy
    pub target_value: Decimal,

    /// Whole shares to buy: floor(target_value / entry_price)
    pub quantity: u64,

    /// Combined boost factor applied on top of the base allocation
    pub applied_multiplier: Decimal,

    /// True when the absolute capital cap was binding
    pub capped: bool,

    /// Present when the request was rejected; quantity is zero
    pub rejection: Option<SizingRejection>,
}

impl PositionSizingResult {
    /// A rejected sizing outcome with zero quantity.
    pub fn rejected(reason: SizingRejection) -> Self {
        Self {
            target_value: Decimal::ZERO,
            quantity: 0,
            applied_multiplier: Decimal::ONE,
            capped: false,
            rejection: Some(reason),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}
