//! Exit state machine: breakeven lock, dynamic trailing stop, tiered
//! take-profit, and momentum / time / volume exits.
//!
//! `advance` is called once per position per monitor tick. Stops, targets,
//! and state only move through monotone `max` updates computed from the
//! previous tick's stored values and the current snapshot — never from
//! history — so replaying the same snapshot is a no-op.

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::debug;

use crate::models::{CloseReason, ExitState, MarketSnapshot, Position};

use super::config::ExitConfig;

/// Per-tick decision for one position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// Nothing to do; stop not armed yet
    Hold,
    /// Stop is armed at this level (unchanged values repeat on replay)
    UpdateStop(Decimal),
    /// Close the position
    Close(CloseReason),
}

/// The state machine driver. Stateless itself; all per-position state lives
/// on the `Position`.
pub struct ExitEngine {
    config: ExitConfig,
}

impl ExitEngine {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    /// Advance one position by one snapshot.
    pub fn advance(&self, position: &mut Position, snapshot: &MarketSnapshot) -> ExitDecision {
        // Terminal state: re-emit the close decision, mutate nothing.
        if position.is_closed() {
            return match position.close_reason {
                Some(reason) => ExitDecision::Close(reason),
                None => ExitDecision::Hold,
            };
        }

        // Replays of an already-applied snapshot must not advance counters.
        let fresh_tick = position.note_snapshot(snapshot.as_of);

        position.current_price = snapshot.price;
        if snapshot.price > position.high_water_mark {
            position.high_water_mark = snapshot.price;
        }

        let profit_pct = position.profit_pct_at(snapshot.price);
        self.promote(position, profit_pct);

        if position.exit_state >= ExitState::BreakevenArmed {
            let breakeven =
                position.entry_price * (Decimal::ONE + self.config.breakeven_offset_pct);
            position.raise_stop(breakeven);
        }

        if position.exit_state >= ExitState::Trailing {
            let trail = self.trail_distance(position, snapshot);
            position.raise_stop(position.high_water_mark * (Decimal::ONE - trail));
        }

        self.ratchet_target(position);

        if fresh_tick {
            if snapshot.volume_ratio < self.config.volume_floor_ratio {
                position.weak_volume_ticks += 1;
            } else {
                position.weak_volume_ticks = 0;
            }
        }

        if let Some(reason) = self.close_reason(position, snapshot, profit_pct) {
            position.exit_state = ExitState::Closed;
            position.close_reason = Some(reason);
            return ExitDecision::Close(reason);
        }

        if position.exit_state >= ExitState::BreakevenArmed {
            ExitDecision::UpdateStop(position.stop_price)
        } else {
            ExitDecision::Hold
        }
    }

    /// Promote to the state this profit level warrants. A gap that crosses
    /// several thresholds in one tick promotes directly; demotion never
    /// happens.
    fn promote(&self, position: &mut Position, profit_pct: Decimal) {
        let c = &self.config;
        let warranted = if profit_pct >= c.moon_threshold_pct {
            ExitState::Moon
        } else if profit_pct >= c.explosive_threshold_pct {
            ExitState::Explosive
        } else if profit_pct >= c.trailing_activation_pct {
            ExitState::Trailing
        } else if profit_pct >= c.breakeven_threshold_pct {
            ExitState::BreakevenArmed
        } else {
            ExitState::Inactive
        };

        if warranted > position.exit_state {
            debug!(
                symbol = %position.symbol,
                from = position.exit_state.as_str(),
                to = warranted.as_str(),
                profit_pct = %profit_pct,
                "Exit state promoted"
            );
            position.exit_state = warranted;
        }
    }

    /// Trailing distance for this tick: widened by realized volatility,
    /// tightened when volume surges while price sits below the high-water
    /// mark, clamped to the configured band.
    fn trail_distance(&self, position: &Position, snapshot: &MarketSnapshot) -> Decimal {
        let c = &self.config;

        let widening = Decimal::try_from(c.volatility_scale * snapshot.volatility)
            .unwrap_or(Decimal::ZERO)
            .max(Decimal::ZERO);
        let mut trail = c.base_trail_pct * (Decimal::ONE + widening);

        let selling_pressure =
            snapshot.volume_surge(c.surge_ratio) && snapshot.price < position.high_water_mark;
        if selling_pressure {
            trail *= c.surge_tighten_factor;
        }

        trail.clamp(c.min_trail_pct, c.max_trail_pct)
    }

    /// Ratchet the take-profit target upward in the extended states. In Moon
    /// the target follows the high-water mark, capped at the maximum
    /// extension over entry.
    fn ratchet_target(&self, position: &mut Position) {
        let c = &self.config;
        let entry = position.entry_price;

        if position.exit_state >= ExitState::Explosive {
            let explosive_target = entry * (Decimal::ONE + c.explosive_target_pct);
            if explosive_target > position.take_profit_price {
                position.take_profit_price = explosive_target;
            }
        }

        if position.exit_state >= ExitState::Moon {
            let floor = entry * (Decimal::ONE + c.moon_target_pct);
            let adaptive = position.high_water_mark * (Decimal::ONE + c.take_profit_pct);
            let ceiling = entry * (Decimal::ONE + c.max_extension_pct);
            let moon_target = floor.max(adaptive).min(ceiling);
            if moon_target > position.take_profit_price {
                position.take_profit_price = moon_target;
            }
        }
    }

    /// Close triggers, checked in fixed priority order.
    fn close_reason(
        &self,
        position: &Position,
        snapshot: &MarketSnapshot,
        profit_pct: Decimal,
    ) -> Option<CloseReason> {
        let c = &self.config;

        if position.stop_price > Decimal::ZERO && snapshot.price <= position.stop_price {
            return Some(CloseReason::StopHit);
        }

        if snapshot.price >= position.take_profit_price {
            return Some(CloseReason::TargetHit);
        }

        if snapshot.momentum < c.momentum_floor && profit_pct <= Decimal::ZERO {
            return Some(CloseReason::MomentumExit);
        }

        let held = snapshot.as_of - position.entry_time;
        if held >= Duration::minutes(c.max_holding_minutes) {
            return Some(CloseReason::TimeExit);
        }

        if position.weak_volume_ticks >= c.volume_decline_ticks {
            return Some(CloseReason::VolumeExit);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionSizingResult;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn engine() -> ExitEngine {
        ExitEngine::new(ExitConfig::default())
    }

    fn open_position(entry: Decimal) -> Position {
        let config = ExitConfig::default();
        Position::open(
            "TEST".to_string(),
            None,
            PositionSizingResult {
                target_value: entry * dec!(10),
                quantity: 10,
                applied_multiplier: Decimal::ONE,
                capped: false,
                rejection: None,
            },
            entry,
            entry * (Decimal::ONE + config.take_profit_pct),
            Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap(),
        )
    }

    fn snap(position: &Position, price: Decimal, minutes_in: i64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: position.symbol.clone(),
            price,
            volume: 1_000_000,
            volume_ratio: 1.0,
            momentum: 60.0,
            volatility: 0.0,
            as_of: position.entry_time + Duration::minutes(minutes_in),
        }
    }

    #[test]
    fn test_breakeven_arms_at_threshold() {
        // Entry $50, price $50.30 (+0.6%)
        let engine = engine();
        let mut pos = open_position(dec!(50));

        let s = snap(&pos, dec!(50.30), 1);
        let decision = engine.advance(&mut pos, &s);

        assert_eq!(pos.exit_state, ExitState::BreakevenArmed);
        assert_eq!(pos.stop_price, dec!(50.05));
        assert_eq!(decision, ExitDecision::UpdateStop(dec!(50.05)));
    }

    #[test]
    fn test_trailing_follows_high_water_mark() {
        // $50 -> $50.30 -> $51.50 (+3%)
        let engine = engine();
        let mut pos = open_position(dec!(50));

        let s1 = snap(&pos, dec!(50.30), 1);
        engine.advance(&mut pos, &s1);
        let s2 = snap(&pos, dec!(51.50), 2);
        let decision = engine.advance(&mut pos, &s2);

        assert_eq!(pos.exit_state, ExitState::Trailing);
        // max(50.05, 51.50 * 0.99)
        assert_eq!(pos.stop_price, dec!(50.985));
        assert_eq!(decision, ExitDecision::UpdateStop(dec!(50.985)));
    }

    #[test]
    fn test_stop_hit_closes() {
        // After trailing to 50.985, price drops to $50.90
        let engine = engine();
        let mut pos = open_position(dec!(50));

        let s1 = snap(&pos, dec!(50.30), 1);
        engine.advance(&mut pos, &s1);
        let s2 = snap(&pos, dec!(51.50), 2);
        engine.advance(&mut pos, &s2);
        let s3 = snap(&pos, dec!(50.90), 3);
        let decision = engine.advance(&mut pos, &s3);

        assert_eq!(decision, ExitDecision::Close(CloseReason::StopHit));
        assert_eq!(pos.exit_state, ExitState::Closed);
    }

    #[test]
    fn test_advance_is_idempotent() {
        let engine = engine();
        let mut pos = open_position(dec!(50));

        let snapshot = snap(&pos, dec!(51.50), 2);
        let first = engine.advance(&mut pos, &snapshot);
        let state = pos.exit_state;
        let stop = pos.stop_price;
        let weak = pos.weak_volume_ticks;

        let second = engine.advance(&mut pos, &snapshot);

        assert_eq!(first, second);
        assert_eq!(pos.exit_state, state);
        assert_eq!(pos.stop_price, stop);
        assert_eq!(pos.weak_volume_ticks, weak);
    }

    #[test]
    fn test_breakeven_is_irreversible() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let s1 = snap(&pos, dec!(100.60), 1);
        engine.advance(&mut pos, &s1);
        assert!(pos.stop_price >= pos.entry_price);

        // Price falls back under the armed stop; the position exits at a
        // stop that never dropped below entry
        let s2 = snap(&pos, dec!(100.05), 2);
        let decision = engine.advance(&mut pos, &s2);
        assert_eq!(decision, ExitDecision::Close(CloseReason::StopHit));
        assert!(pos.stop_price >= pos.entry_price);
    }

    #[test]
    fn test_gap_promotes_straight_to_explosive() {
        let engine = engine();
        let mut pos = open_position(dec!(10));

        // +12% in a single tick
        let s = snap(&pos, dec!(11.20), 1);
        engine.advance(&mut pos, &s);
        assert_eq!(pos.exit_state, ExitState::Explosive);
        // Target lifted from 5% to 15% over entry
        assert_eq!(pos.take_profit_price, dec!(11.50));
    }

    #[test]
    fn test_moon_target_rides_high_water_mark() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let s1 = snap(&pos, dec!(130), 1);
        engine.advance(&mut pos, &s1);
        assert_eq!(pos.exit_state, ExitState::Moon);
        // max(entry*1.40, hwm*1.05) = max(140, 136.50)
        assert_eq!(pos.take_profit_price, dec!(140));

        let s2 = snap(&pos, dec!(138), 2);
        engine.advance(&mut pos, &s2);
        // hwm 138 * 1.05 = 144.90
        assert_eq!(pos.take_profit_price, dec!(144.90));

        // Capped at entry * 1.50
        let s3 = snap(&pos, dec!(148), 3);
        engine.advance(&mut pos, &s3);
        assert_eq!(pos.take_profit_price, dec!(150));
    }

    #[test]
    fn test_momentum_exit_only_when_not_profitable() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let mut weak = snap(&pos, dec!(99.50), 1);
        weak.momentum = 25.0;
        let decision = engine.advance(&mut pos, &weak);
        assert_eq!(decision, ExitDecision::Close(CloseReason::MomentumExit));

        // Same momentum while in profit holds
        let mut pos = open_position(dec!(100));
        let mut weak = snap(&pos, dec!(100.40), 1);
        weak.momentum = 25.0;
        let decision = engine.advance(&mut pos, &weak);
        assert_eq!(decision, ExitDecision::Hold);
    }

    #[test]
    fn test_time_exit_after_max_holding() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let s = snap(&pos, dec!(100.20), 241);
        let decision = engine.advance(&mut pos, &s);
        assert_eq!(decision, ExitDecision::Close(CloseReason::TimeExit));
    }

    #[test]
    fn test_volume_exit_requires_sustained_decline() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        for minute in 1..=2 {
            let mut thin = snap(&pos, dec!(100.20), minute);
            thin.volume_ratio = 0.3;
            assert_eq!(engine.advance(&mut pos, &thin), ExitDecision::Hold);
        }

        let mut thin = snap(&pos, dec!(100.20), 3);
        thin.volume_ratio = 0.3;
        let decision = engine.advance(&mut pos, &thin);
        assert_eq!(decision, ExitDecision::Close(CloseReason::VolumeExit));
    }

    #[test]
    fn test_volume_streak_resets_on_normal_volume() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let mut thin = snap(&pos, dec!(100.20), 1);
        thin.volume_ratio = 0.3;
        engine.advance(&mut pos, &thin);
        assert_eq!(pos.weak_volume_ticks, 1);

        let s = snap(&pos, dec!(100.20), 2);
        engine.advance(&mut pos, &s);
        assert_eq!(pos.weak_volume_ticks, 0);
    }

    #[test]
    fn test_stop_priority_beats_target() {
        // Both stop and target trigger on the same tick: stop wins because
        // it is checked first.
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let s1 = snap(&pos, dec!(103), 1);
        engine.advance(&mut pos, &s1);
        assert_eq!(pos.stop_price, dec!(101.97));

        // Force a target below the stop, then print between them
        pos.take_profit_price = dec!(100.10);
        let s2 = snap(&pos, dec!(100.50), 2);
        let decision = engine.advance(&mut pos, &s2);
        assert_eq!(decision, ExitDecision::Close(CloseReason::StopHit));
    }

    #[test]
    fn test_surge_on_weakness_tightens_trail() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let s1 = snap(&pos, dec!(103), 1);
        engine.advance(&mut pos, &s1);
        assert_eq!(pos.stop_price, dec!(103) * dec!(0.99));

        // Heavy volume with price off the high: trail tightens to
        // max(0.5%, 1% * 0.6) = 0.6%
        let mut surge = snap(&pos, dec!(102.80), 2);
        surge.volume_ratio = 2.5;
        engine.advance(&mut pos, &surge);
        assert_eq!(pos.stop_price, dec!(103) * dec!(0.994));
    }

    #[test]
    fn test_volatility_widens_trail_within_clamp() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let mut wild = snap(&pos, dec!(103), 1);
        wild.volatility = 0.5; // trail = 1% * (1 + 2.0*0.5) = 2%
        engine.advance(&mut pos, &wild);
        assert_eq!(pos.stop_price, dec!(103) * dec!(0.98));

        let mut wilder = snap(&pos, dec!(103), 2);
        wilder.volatility = 10.0; // clamped at max_trail 5%
        engine.advance(&mut pos, &wilder);
        // Candidate 103*0.95 is below the existing stop; stop holds
        assert_eq!(pos.stop_price, dec!(103) * dec!(0.98));
    }

    #[test]
    fn test_closed_position_is_not_mutated() {
        let engine = engine();
        let mut pos = open_position(dec!(100));

        let mut weak = snap(&pos, dec!(99), 1);
        weak.momentum = 20.0;
        engine.advance(&mut pos, &weak);
        assert_eq!(pos.exit_state, ExitState::Closed);

        let frozen = pos.clone();
        let s = snap(&pos, dec!(150), 2);
        let decision = engine.advance(&mut pos, &s);
        assert_eq!(decision, ExitDecision::Close(CloseReason::MomentumExit));
        assert_eq!(pos.stop_price, frozen.stop_price);
        assert_eq!(pos.current_price, frozen.current_price);
    }
}
