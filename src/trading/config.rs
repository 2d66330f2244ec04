//! Risk configuration: sizing, exit, monitor, and retry settings.
//!
//! One immutable, typed configuration object is built at startup, validated,
//! and injected into the sizer, the exit engine, and the monitor. No
//! module-level state.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::models::AgreementLevel;

/// One confidence tier: signals at or above `min_confidence` get `multiplier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceTier {
    pub min_confidence: f64,
    pub multiplier: Decimal,
}

/// One profit-scaling tier: cumulative realized profit at or above
/// `min_profit_pct` gets `multiplier`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitTier {
    pub min_profit_pct: Decimal,
    pub multiplier: Decimal,
}

/// Additive bonus per strategy-agreement level, applied as `*(1 + bonus)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementBonuses {
    pub none: Decimal,
    pub low: Decimal,
    pub medium: Decimal,
    pub high: Decimal,
    pub maximum: Decimal,
}

impl AgreementBonuses {
    pub fn bonus_for(&self, level: AgreementLevel) -> Decimal {
        match level {
            AgreementLevel::None => self.none,
            AgreementLevel::Low => self.low,
            AgreementLevel::Medium => self.medium,
            AgreementLevel::High => self.high,
            AgreementLevel::Maximum => self.maximum,
        }
    }
}

impl Default for AgreementBonuses {
    fn default() -> Self {
        Self {
            none: Decimal::ZERO,
            low: Decimal::ZERO,
            medium: dec!(0.25),
            high: dec!(0.50),
            maximum: dec!(1.00),
        }
    }
}

/// Win-streak multiplier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinStreakConfig {
    pub enabled: bool,

    /// Multiplier increment per consecutive winning close
    pub per_win: Decimal,

    /// Ceiling on the streak multiplier
    pub max_multiplier: Decimal,
}

impl Default for WinStreakConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_win: dec!(0.05),
            max_multiplier: dec!(1.25),
        }
    }
}

/// Position sizing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    /// Base allocation as a fraction of available trading capital
    pub base_position_fraction: Decimal,

    /// Fraction of total cash held back from trading
    pub cash_reserve_fraction: Decimal,

    /// Confidence step tiers, highest threshold first
    pub confidence_tiers: Vec<ConfidenceTier>,

    /// Agreement-level bonus table
    pub agreement_bonuses: AgreementBonuses,

    /// Profit-scaling tiers on realized profit since inception, highest first
    pub profit_tiers: Vec<ProfitTier>,

    /// Win-streak multiplier settings
    pub win_streak: WinStreakConfig,

    /// Per-strategy cap as a fraction of available capital, keyed by tag
    pub strategy_caps: HashMap<String, Decimal>,

    /// Absolute ceiling as a fraction of available capital
    pub absolute_cap_fraction: Decimal,

    /// Smallest position worth opening, in dollars
    pub min_position_value: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_position_fraction: dec!(0.10), // 10% of available capital
            cash_reserve_fraction: dec!(0.10),  // Keep 10% cash back
            confidence_tiers: vec![
                ConfidenceTier { min_confidence: 0.995, multiplier: dec!(1.5) },
                ConfidenceTier { min_confidence: 0.95, multiplier: dec!(1.2) },
                ConfidenceTier { min_confidence: 0.90, multiplier: dec!(1.0) },
            ],
            agreement_bonuses: AgreementBonuses::default(),
            profit_tiers: vec![
                ProfitTier { min_profit_pct: dec!(1.00), multiplier: dec!(1.5) },
                ProfitTier { min_profit_pct: dec!(0.50), multiplier: dec!(1.35) },
                ProfitTier { min_profit_pct: dec!(0.25), multiplier: dec!(1.2) },
                ProfitTier { min_profit_pct: dec!(0.10), multiplier: dec!(1.1) },
            ],
            win_streak: WinStreakConfig::default(),
            strategy_caps: HashMap::new(),
            absolute_cap_fraction: dec!(0.35), // Max 35% in one position
            min_position_value: dec!(100),     // Min $100
        }
    }
}

/// Exit engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Profit fraction that arms the breakeven stop
    pub breakeven_threshold_pct: Decimal,

    /// Breakeven stop offset above entry
    pub breakeven_offset_pct: Decimal,

    /// Profit fraction that activates trailing
    pub trailing_activation_pct: Decimal,

    /// Trailing distance before dynamic adjustment
    pub base_trail_pct: Decimal,

    /// Lower clamp on the trailing distance
    pub min_trail_pct: Decimal,

    /// Upper clamp on the trailing distance
    pub max_trail_pct: Decimal,

    /// Trail widening per unit of realized volatility
    pub volatility_scale: f64,

    /// Volume ratio that counts as a surge
    pub surge_ratio: f64,

    /// Trail multiplier when volume surges below the high-water mark
    pub surge_tighten_factor: Decimal,

    /// Move since entry that promotes to Explosive
    pub explosive_threshold_pct: Decimal,

    /// Move since entry that promotes to Moon
    pub moon_threshold_pct: Decimal,

    /// Initial take-profit distance above entry
    pub take_profit_pct: Decimal,

    /// Take-profit distance once Explosive
    pub explosive_target_pct: Decimal,

    /// Take-profit distance once Moon
    pub moon_target_pct: Decimal,

    /// Ceiling on any take-profit extension
    pub max_extension_pct: Decimal,

    /// Momentum reading below which a flat-or-losing position exits
    pub momentum_floor: f64,

    /// Maximum holding time in minutes
    pub max_holding_minutes: i64,

    /// Volume ratio below which a tick counts as declining
    pub volume_floor_ratio: f64,

    /// Consecutive declining ticks that trigger a volume exit
    pub volume_decline_ticks: u32,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            breakeven_threshold_pct: dec!(0.005), // +0.5% arms breakeven
            breakeven_offset_pct: dec!(0.001),    // Stop at entry +0.1%
            trailing_activation_pct: dec!(0.01),  // +1% starts trailing
            base_trail_pct: dec!(0.01),           // 1% trail
            min_trail_pct: dec!(0.005),           // Never tighter than 0.5%
            max_trail_pct: dec!(0.05),            // Never wider than 5%
            volatility_scale: 2.0,
            surge_ratio: 2.0,                     // 2x average volume
            surge_tighten_factor: dec!(0.6),
            explosive_threshold_pct: dec!(0.10),  // +10% is explosive
            moon_threshold_pct: dec!(0.25),       // +25% is moon
            take_profit_pct: dec!(0.05),          // 5% initial target
            explosive_target_pct: dec!(0.15),
            moon_target_pct: dec!(0.40),
            max_extension_pct: dec!(0.50),
            momentum_floor: 40.0,
            max_holding_minutes: 240,             // 4 hours
            volume_floor_ratio: 0.5,
            volume_decline_ticks: 3,
        }
    }
}

/// Monitor loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between evaluation ticks
    pub tick_interval_secs: u64,

    /// Refresh ledger cash from the broker every this many ticks
    pub cash_refresh_ticks: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            cash_refresh_ticks: 15,
        }
    }
}

/// Bounded retry settings for broker calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Transport attempts per broker call
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,

    /// Size factor for the single reduced-size retry after a rejected open
    pub reduced_size_factor: Decimal,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5_000,
            reduced_size_factor: dec!(0.5),
        }
    }
}

/// Top-level risk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub sizing: SizingConfig,
    pub exits: ExitConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
}

impl RiskConfig {
    /// Load from a JSON file, falling back to defaults for absent sections.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::configuration(format!(
                "cannot read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EngineError::configuration(format!("cannot parse config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate thresholds and tier tables. Called once before the loop
    /// starts; a failure here is fatal.
    pub fn validate(&self) -> EngineResult<()> {
        let s = &self.sizing;

        ensure_fraction("sizing.base_position_fraction", s.base_position_fraction)?;
        ensure_fraction("sizing.absolute_cap_fraction", s.absolute_cap_fraction)?;
        if s.cash_reserve_fraction < Decimal::ZERO || s.cash_reserve_fraction >= Decimal::ONE {
            return Err(EngineError::configuration(
                "sizing.cash_reserve_fraction must be in [0, 1)",
            ));
        }
        if s.min_position_value < Decimal::ZERO {
            return Err(EngineError::configuration(
                "sizing.min_position_value must be >= 0",
            ));
        }

        ensure_descending_confidence(&s.confidence_tiers)?;
        ensure_descending_profit(&s.profit_tiers)?;

        for level in [
            s.agreement_bonuses.none,
            s.agreement_bonuses.low,
            s.agreement_bonuses.medium,
            s.agreement_bonuses.high,
            s.agreement_bonuses.maximum,
        ] {
            if level < Decimal::ZERO {
                return Err(EngineError::configuration(
                    "sizing.agreement_bonuses entries must be >= 0",
                ));
            }
        }

        for (tag, cap) in &s.strategy_caps {
            if *cap <= Decimal::ZERO || *cap > Decimal::ONE {
                return Err(EngineError::configuration(format!(
                    "sizing.strategy_caps[{tag}] must be in (0, 1]"
                )));
            }
        }

        if s.win_streak.per_win < Decimal::ZERO || s.win_streak.max_multiplier < Decimal::ONE {
            return Err(EngineError::configuration(
                "sizing.win_streak: per_win must be >= 0 and max_multiplier >= 1",
            ));
        }

        let e = &self.exits;
        if e.breakeven_threshold_pct <= Decimal::ZERO || e.breakeven_offset_pct < Decimal::ZERO {
            return Err(EngineError::configuration(
                "exits.breakeven thresholds must be positive",
            ));
        }
        if e.trailing_activation_pct < e.breakeven_threshold_pct {
            return Err(EngineError::configuration(
                "exits.trailing_activation_pct must be >= breakeven_threshold_pct",
            ));
        }
        if e.min_trail_pct <= Decimal::ZERO
            || e.min_trail_pct > e.base_trail_pct
            || e.base_trail_pct > e.max_trail_pct
        {
            return Err(EngineError::configuration(
                "exits trail bounds must satisfy 0 < min <= base <= max",
            ));
        }
        if e.explosive_threshold_pct >= e.moon_threshold_pct {
            return Err(EngineError::configuration(
                "exits.explosive_threshold_pct must be < moon_threshold_pct",
            ));
        }
        if e.take_profit_pct <= Decimal::ZERO
            || e.explosive_target_pct < e.take_profit_pct
            || e.moon_target_pct < e.explosive_target_pct
            || e.max_extension_pct < e.moon_target_pct
        {
            return Err(EngineError::configuration(
                "exits targets must satisfy 0 < initial <= explosive <= moon <= max_extension",
            ));
        }
        if !(0.0..=100.0).contains(&e.momentum_floor) {
            return Err(EngineError::configuration(
                "exits.momentum_floor must be in [0, 100]",
            ));
        }
        if e.max_holding_minutes <= 0 {
            return Err(EngineError::configuration(
                "exits.max_holding_minutes must be > 0",
            ));
        }
        if e.volume_decline_ticks == 0 {
            return Err(EngineError::configuration(
                "exits.volume_decline_ticks must be >= 1",
            ));
        }

        if self.monitor.tick_interval_secs == 0 {
            return Err(EngineError::configuration(
                "monitor.tick_interval_secs must be > 0",
            ));
        }
        if self.monitor.cash_refresh_ticks == 0 {
            return Err(EngineError::configuration(
                "monitor.cash_refresh_ticks must be >= 1",
            ));
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return Err(EngineError::configuration("retry.max_attempts must be >= 1"));
        }
        if r.reduced_size_factor <= Decimal::ZERO || r.reduced_size_factor >= Decimal::ONE {
            return Err(EngineError::configuration(
                "retry.reduced_size_factor must be in (0, 1)",
            ));
        }

        Ok(())
    }
}

fn ensure_fraction(name: &str, value: Decimal) -> EngineResult<()> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(EngineError::configuration(format!(
            "{name} must be in (0, 1]"
        )));
    }
    Ok(())
}

fn ensure_descending_confidence(tiers: &[ConfidenceTier]) -> EngineResult<()> {
    let mut prev: Option<f64> = None;
    for tier in tiers {
        if !(0.0..=1.0).contains(&tier.min_confidence) {
            return Err(EngineError::configuration(
                "sizing.confidence_tiers thresholds must be in [0, 1]",
            ));
        }
        if tier.multiplier <= Decimal::ZERO {
            return Err(EngineError::configuration(
                "sizing.confidence_tiers multipliers must be > 0",
            ));
        }
        if let Some(p) = prev {
            if tier.min_confidence >= p {
                return Err(EngineError::configuration(
                    "sizing.confidence_tiers must be sorted by descending threshold",
                ));
            }
        }
        prev = Some(tier.min_confidence);
    }
    Ok(())
}

fn ensure_descending_profit(tiers: &[ProfitTier]) -> EngineResult<()> {
    let mut prev: Option<Decimal> = None;
    for tier in tiers {
        if tier.multiplier <= Decimal::ZERO {
            return Err(EngineError::configuration(
                "sizing.profit_tiers multipliers must be > 0",
            ));
        }
        if let Some(p) = prev {
            if tier.min_profit_pct >= p {
                return Err(EngineError::configuration(
                    "sizing.profit_tiers must be sorted by descending threshold",
                ));
            }
        }
        prev = Some(tier.min_profit_pct);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        RiskConfig::default().validate().unwrap();
    }

    #[test]
    fn test_unsorted_confidence_tiers_rejected() {
        let mut config = RiskConfig::default();
        config.sizing.confidence_tiers = vec![
            ConfidenceTier { min_confidence: 0.90, multiplier: dec!(1.0) },
            ConfidenceTier { min_confidence: 0.95, multiplier: dec!(1.2) },
        ];
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_trail_bounds_ordering_enforced() {
        let mut config = RiskConfig::default();
        config.exits.min_trail_pct = dec!(0.02); // above base_trail
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let mut config = RiskConfig::default();
        config.monitor.tick_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let parsed: RiskConfig =
            serde_json::from_str(r#"{"sizing": {"base_position_fraction": "0.05"}}"#).unwrap();
        assert_eq!(parsed.sizing.base_position_fraction, dec!(0.05));
        assert_eq!(parsed.exits.breakeven_threshold_pct, dec!(0.005));
        parsed.validate().unwrap();
    }
}
