//! Position sizing: confidence tiers, agreement bonus, profit scaling,
//! win-streak boost, then strategy and absolute caps.
//!
//! The sizer is a pure function of the signal, the ledger, and its config.
//! Rejections come back as values; only malformed numeric input is an error.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::errors::{EngineError, EngineResult};
use crate::models::{PositionSizingResult, SizingRejection, TradeSignal};

use super::config::SizingConfig;
use super::ledger::CapitalLedger;

/// Calculator for target position values.
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    /// Size a new position for `signal` against the current ledger.
    ///
    /// # Errors
    /// `Validation` when `entry_price <= 0` or confidence is outside [0, 1].
    /// Every other outcome, including "don't trade", is a value.
    pub fn size(
        &self,
        signal: &TradeSignal,
        ledger: &CapitalLedger,
    ) -> EngineResult<PositionSizingResult> {
        if signal.entry_price <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "entry price must be positive, got {}",
                signal.entry_price
            )));
        }
        if !(0.0..=1.0).contains(&signal.confidence) {
            return Err(EngineError::validation(format!(
                "confidence must be in [0, 1], got {}",
                signal.confidence
            )));
        }

        let available = ledger.available_trading_capital();
        if available <= Decimal::ZERO {
            return Ok(PositionSizingResult::rejected(SizingRejection::NoCapital));
        }

        let base_value = available * self.config.base_position_fraction;

        let confidence_multiplier = self.confidence_multiplier(signal.confidence);
        let agreement_bonus = self.config.agreement_bonuses.bonus_for(signal.agreement);
        let profit_multiplier = self.profit_multiplier(ledger.realized_profit_pct());
        let streak_multiplier = self.win_streak_multiplier(ledger.win_streak());

        let applied_multiplier = confidence_multiplier
            * (Decimal::ONE + agreement_bonus)
            * profit_multiplier
            * streak_multiplier;

        let candidate_value = base_value * applied_multiplier;

        // Strategy cap first, then the absolute ceiling
        let strategy_capped = match self.strategy_cap(signal.strategy.as_deref()) {
            Some(cap_fraction) => candidate_value.min(available * cap_fraction),
            None => candidate_value,
        };

        let absolute_cap_value = available * self.config.absolute_cap_fraction;
        let capped = strategy_capped > absolute_cap_value;
        let target_value = strategy_capped.min(absolute_cap_value);

        if target_value < self.config.min_position_value {
            return Ok(PositionSizingResult::rejected(SizingRejection::BelowMinimum));
        }

        let quantity = (target_value / signal.entry_price)
            .floor()
            .to_u64()
            .unwrap_or(0);
        if quantity == 0 {
            return Ok(PositionSizingResult::rejected(SizingRejection::ZeroQuantity));
        }

        Ok(PositionSizingResult {
            target_value,
            quantity,
            applied_multiplier,
            capped,
            rejection: None,
        })
    }

    /// Step-function lookup, highest tier first.
    fn confidence_multiplier(&self, confidence: f64) -> Decimal {
        self.config
            .confidence_tiers
            .iter()
            .find(|t| confidence >= t.min_confidence)
            .map(|t| t.multiplier)
            .unwrap_or(Decimal::ONE)
    }

    fn profit_multiplier(&self, realized_profit_pct: Decimal) -> Decimal {
        self.config
            .profit_tiers
            .iter()
            .find(|t| realized_profit_pct >= t.min_profit_pct)
            .map(|t| t.multiplier)
            .unwrap_or(Decimal::ONE)
    }

    fn win_streak_multiplier(&self, streak: u32) -> Decimal {
        let ws = &self.config.win_streak;
        if !ws.enabled || streak == 0 {
            return Decimal::ONE;
        }
        (Decimal::ONE + ws.per_win * Decimal::from(streak)).min(ws.max_multiplier)
    }

    fn strategy_cap(&self, strategy: Option<&str>) -> Option<Decimal> {
        strategy.and_then(|tag| self.config.strategy_caps.get(tag).copied())
    }
}
