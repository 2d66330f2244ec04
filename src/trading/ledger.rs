//! Capital ledger: cash, reserve, open position value, and realized P&L.
//!
//! Owned exclusively by the position monitor. The sizer reads it through a
//! shared reference and never mutates it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Session-lifetime capital accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalLedger {
    /// Cash in the account, refreshed from the broker on a schedule
    total_cash: Decimal,

    /// Fraction of total cash held out of trading
    cash_reserve_fraction: Decimal,

    /// Sum of open positions' current market value
    open_position_value: Decimal,

    /// Account equity at session inception, for profit-scaling lookups
    initial_equity: Decimal,

    /// Realized P&L accumulated over the session
    realized_pnl: Decimal,

    /// Consecutive winning closes
    win_streak: u32,
}

impl CapitalLedger {
    pub fn new(total_cash: Decimal, cash_reserve_fraction: Decimal) -> Self {
        Self {
            total_cash,
            cash_reserve_fraction,
            open_position_value: Decimal::ZERO,
            initial_equity: total_cash,
            realized_pnl: Decimal::ZERO,
            win_streak: 0,
        }
    }

    /// Cash held out of trading.
    pub fn reserved_cash(&self) -> Decimal {
        self.total_cash * self.cash_reserve_fraction
    }

    /// Capital the sizer may allocate against, never negative.
    pub fn available_trading_capital(&self) -> Decimal {
        let available = (self.total_cash - self.reserved_cash()) + self.open_position_value;
        available.max(Decimal::ZERO)
    }

    /// Realized profit as a fraction of inception equity.
    pub fn realized_profit_pct(&self) -> Decimal {
        if self.initial_equity.is_zero() {
            return Decimal::ZERO;
        }
        self.realized_pnl / self.initial_equity
    }

    pub fn total_cash(&self) -> Decimal {
        self.total_cash
    }

    pub fn open_position_value(&self) -> Decimal {
        self.open_position_value
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn win_streak(&self) -> u32 {
        self.win_streak
    }

    /// Debit cash and add position value on a confirmed open fill.
    pub fn record_open(&mut self, cost: Decimal) {
        self.total_cash -= cost;
        self.open_position_value += cost;
        debug!(cost = %cost, cash = %self.total_cash, "Ledger: position opened");
    }

    /// Track mark-to-market drift of the open book between ticks.
    pub fn revalue_positions(&mut self, previous_value: Decimal, current_value: Decimal) {
        self.open_position_value += current_value - previous_value;
    }

    /// Credit proceeds and remove position value on a confirmed close fill.
    pub fn record_close(&mut self, position_value: Decimal, proceeds: Decimal, pnl: Decimal) {
        self.total_cash += proceeds;
        self.open_position_value -= position_value;
        self.realized_pnl += pnl;

        if pnl > Decimal::ZERO {
            self.win_streak += 1;
        } else {
            self.win_streak = 0;
        }

        debug!(
            proceeds = %proceeds,
            pnl = %pnl,
            streak = self.win_streak,
            "Ledger: position closed"
        );
    }

    /// Overwrite cash with the broker's authoritative balance.
    pub fn refresh_cash(&mut self, broker_cash: Decimal) {
        self.total_cash = broker_cash;
    }
}
