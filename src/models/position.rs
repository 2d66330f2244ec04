//! Position model: one open long position under stealth exit management.
//!
//! Stop and target levels live here, in memory, and are never submitted as
//! resting orders to the broker.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::signal::PositionSizingResult;

/// Where the position sits in the exit process.
///
/// Variant order is the promotion order: a position only ever moves to a
/// later variant, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitState {
    /// Initial state; stop not yet armed
    Inactive,
    /// Stop moved above entry; the position can no longer close at a loss
    /// barring gaps
    BreakevenArmed,
    /// Stop trails the high-water mark at a dynamic distance
    Trailing,
    /// Extended move; take-profit target recomputed upward
    Explosive,
    /// Exceptional move; target allows the maximum configured extension
    Moon,
    /// Terminal; awaiting close confirmation, then removed from the registry
    Closed,
}

impl ExitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitState::Inactive => "INACTIVE",
            ExitState::BreakevenArmed => "BREAKEVEN_ARMED",
            ExitState::Trailing => "TRAILING",
            ExitState::Explosive => "EXPLOSIVE",
            ExitState::Moon => "MOON",
            ExitState::Closed => "CLOSED",
        }
    }
}

/// Why a position was closed. Checked in this order every tick, so ties
/// resolve deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    StopHit,
    TargetHit,
    MomentumExit,
    TimeExit,
    VolumeExit,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::StopHit => "STOP_HIT",
            CloseReason::TargetHit => "TARGET_HIT",
            CloseReason::MomentumExit => "MOMENTUM_EXIT",
            CloseReason::TimeExit => "TIME_EXIT",
            CloseReason::VolumeExit => "VOLUME_EXIT",
        }
    }
}

/// An open long position, owned exclusively by the position monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,

    pub symbol: String,

    /// Whole shares held; > 0 while open
    pub quantity: u64,

    /// Fill price at entry
    pub entry_price: Decimal,

    pub entry_time: DateTime<Utc>,

    /// Last observed price
    pub current_price: Decimal,

    /// Best price seen since entry
    pub high_water_mark: Decimal,

    /// Internal stop level; monotone non-decreasing
    pub stop_price: Decimal,

    /// Internal take-profit level; ratchets upward in Explosive/Moon
    pub take_profit_price: Decimal,

    pub exit_state: ExitState,

    /// Set when the exit engine decides to close; retained while the close
    /// order is retried
    #[serde(default)]
    pub close_reason: Option<CloseReason>,

    /// The sizing decision this position was opened from
    pub opened_from: PositionSizingResult,

    /// Strategy tag carried over from the signal
    #[serde(default)]
    pub strategy: Option<String>,

    /// Timestamp of the last snapshot applied; guards tick counters against
    /// replays of the same snapshot
    #[serde(default)]
    pub last_snapshot_at: Option<DateTime<Utc>>,

    /// Consecutive ticks with volume below the decline floor
    #[serde(default)]
    pub weak_volume_ticks: u32,

    /// Failed close attempts so far; drives alert severity escalation
    #[serde(default)]
    pub close_attempts: u32,
}

impl Position {
    /// Create a freshly filled position.
    pub fn open(
        symbol: String,
        strategy: Option<String>,
        sized: PositionSizingResult,
        fill_price: Decimal,
        take_profit_price: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            quantity: sized.quantity,
            entry_price: fill_price,
            entry_time: opened_at,
            current_price: fill_price,
            high_water_mark: fill_price,
            stop_price: Decimal::ZERO,
            take_profit_price,
            exit_state: ExitState::Inactive,
            close_reason: None,
            opened_from: sized,
            strategy,
            last_snapshot_at: None,
            weak_volume_ticks: 0,
            close_attempts: 0,
        }
    }

    /// Profit fraction relative to entry at the given price.
    pub fn profit_pct_at(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price
    }

    /// Profit fraction at the last observed price.
    pub fn profit_pct(&self) -> Decimal {
        self.profit_pct_at(self.current_price)
    }

    /// Current market value of the position.
    pub fn market_value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.current_price
    }

    /// Cost basis at entry.
    pub fn cost_basis(&self) -> Decimal {
        Decimal::from(self.quantity) * self.entry_price
    }

    /// Raise the stop. A lower candidate is ignored; the stop never loosens.
    pub fn raise_stop(&mut self, candidate: Decimal) {
        if candidate > self.stop_price {
            self.stop_price = candidate;
        }
    }

    /// Record the snapshot timestamp. Returns false when this exact snapshot
    /// was already applied, in which case tick counters must not advance.
    pub fn note_snapshot(&mut self, as_of: DateTime<Utc>) -> bool {
        if self.last_snapshot_at == Some(as_of) {
            return false;
        }
        self.last_snapshot_at = Some(as_of);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.exit_state == ExitState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_at(entry: Decimal) -> Position {
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
            entry * dec!(1.05),
            Utc::now(),
        )
    }

    #[test]
    fn test_profit_pct() {
        let mut pos = open_at(dec!(100));
        pos.current_price = dec!(103);
        assert_eq!(pos.profit_pct(), dec!(0.03));
    }

    #[test]
    fn test_stop_never_loosens() {
        let mut pos = open_at(dec!(50));
        pos.raise_stop(dec!(50.05));
        pos.raise_stop(dec!(49.00));
        assert_eq!(pos.stop_price, dec!(50.05));

        pos.raise_stop(dec!(50.985));
        assert_eq!(pos.stop_price, dec!(50.985));
    }

    #[test]
    fn test_state_ordering_matches_promotion_order() {
        assert!(ExitState::Inactive < ExitState::BreakevenArmed);
        assert!(ExitState::BreakevenArmed < ExitState::Trailing);
        assert!(ExitState::Trailing < ExitState::Explosive);
        assert!(ExitState::Explosive < ExitState::Moon);
        assert!(ExitState::Moon < ExitState::Closed);
    }

    #[test]
    fn test_note_snapshot_detects_replay() {
        let mut pos = open_at(dec!(10));
        let ts = Utc::now();
        assert!(pos.note_snapshot(ts));
        assert!(!pos.note_snapshot(ts));
    }
}
