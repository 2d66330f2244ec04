//! Position monitor: the single supervising loop that owns the registry and
//! the capital ledger.
//!
//! Each tick it pulls one batched snapshot, feeds every open position
//! through the exit engine, applies the decisions, and retries unconfirmed
//! closes. Ticks never overlap: a slow tick defers the next one. The
//! registry and ledger are owned here exclusively, so nothing else mutates
//! them and no locks are needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{Broker, MarketData, TradingCalendar};
use crate::errors::EngineResult;
use crate::models::{Position, TradeSignal};
use crate::notify::Notifier;
use crate::trading::config::MonitorConfig;
use crate::trading::{ExitDecision, ExitEngine, CapitalLedger, TradeManager};

/// The supervising poll loop.
pub struct PositionMonitor<B, M, C, N> {
    config: MonitorConfig,
    engine: ExitEngine,
    manager: TradeManager<B, N>,
    market_data: M,
    calendar: C,
    ledger: CapitalLedger,
    positions: HashMap<Uuid, Position>,
    signals: mpsc::Receiver<TradeSignal>,
    shutdown: Arc<AtomicBool>,
    ticks: u64,
}

impl<B, M, C, N> PositionMonitor<B, M, C, N>
where
    B: Broker,
    M: MarketData,
    C: TradingCalendar,
    N: Notifier,
{
    pub fn new(
        config: MonitorConfig,
        engine: ExitEngine,
        manager: TradeManager<B, N>,
        market_data: M,
        calendar: C,
        ledger: CapitalLedger,
        signals: mpsc::Receiver<TradeSignal>,
    ) -> Self {
        Self {
            config,
            engine,
            manager,
            market_data,
            calendar,
            ledger,
            positions: HashMap::new(),
            signals,
            shutdown: Arc::new(AtomicBool::new(false)),
            ticks: 0,
        }
    }

    /// Handle for external shutdown control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn ledger(&self) -> &CapitalLedger {
        &self.ledger
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Main loop. A tick that overruns the interval defers the next tick;
    /// evaluations for one position never run concurrently.
    pub async fn run(&mut self) -> EngineResult<()> {
        info!(
            interval_secs = self.config.tick_interval_secs,
            "Starting position monitor"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown.load(Ordering::SeqCst) {
            interval.tick().await;

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.tick(Utc::now()).await {
                // Per-position errors are already isolated; anything that
                // reaches here aborted the whole tick.
                error!(error = %e, "Monitor tick failed");
            }
        }

        info!(
            open_positions = self.positions.len(),
            "Position monitor stopped"
        );
        Ok(())
    }

    /// One evaluation pass. Public so scripted sessions and tests can drive
    /// the loop with their own clock.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.ticks += 1;

        // No stop/target decay while markets are closed
        if !self.calendar.is_market_open(now) {
            debug!("Market closed; skipping tick");
            return Ok(());
        }

        if self.ticks % u64::from(self.config.cash_refresh_ticks) == 0 {
            match self.manager.broker_cash().await {
                Ok(cash) => self.ledger.refresh_cash(cash),
                Err(e) => warn!(error = %e, "Cash refresh failed; keeping ledger figure"),
            }
        }

        // New entry signals first, so fresh positions join this tick's watch
        while let Ok(signal) = self.signals.try_recv() {
            self.handle_signal(signal).await;
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
        }

        let symbols = self.watched_symbols();
        let snapshots = if symbols.is_empty() {
            HashMap::new()
        } else {
            match self.market_data.snapshots(&symbols).await {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "Batch snapshot fetch failed; holding all positions");
                    HashMap::new()
                }
            }
        };

        let ids: Vec<Uuid> = self.positions.keys().copied().collect();
        for id in ids {
            // Cooperative stop between positions; in-flight work completed
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let Some(position) = self.positions.get_mut(&id) else {
                continue;
            };

            if !position.is_closed() {
                let Some(snapshot) = snapshots.get(&position.symbol) else {
                    debug!(
                        symbol = %position.symbol,
                        "Snapshot unavailable; holding position over"
                    );
                    continue;
                };

                let previous_value = position.market_value();
                let decision = self.engine.advance(position, snapshot);
                let current_value = position.market_value();
                self.ledger.revalue_positions(previous_value, current_value);

                match decision {
                    ExitDecision::Hold => {}
                    ExitDecision::UpdateStop(stop) => {
                        debug!(
                            symbol = %position.symbol,
                            state = position.exit_state.as_str(),
                            stop = %stop,
                            "Stop level tracked"
                        );
                    }
                    ExitDecision::Close(reason) => {
                        info!(
                            symbol = %position.symbol,
                            reason = reason.as_str(),
                            price = %position.current_price,
                            "Exit triggered"
                        );
                    }
                }
            }

            if position.is_closed() {
                let Some(reason) = position.close_reason else {
                    continue;
                };
                if let Some(fill) = self.manager.close_position(position, reason).await {
                    let book_value = position.market_value();
                    let shares = Decimal::from(position.quantity);
                    let proceeds = fill * shares;
                    let pnl = (fill - position.entry_price) * shares;
                    self.ledger.record_close(book_value, proceeds, pnl);
                    self.positions.remove(&id);
                }
                // Unconfirmed closes stay registered and retry next tick
            }
        }

        debug!(
            open_positions = self.positions.len(),
            open_value = %self.ledger.open_position_value(),
            cash = %self.ledger.total_cash(),
            realized_pnl = %self.ledger.realized_pnl(),
            "Tick complete"
        );

        Ok(())
    }

    async fn handle_signal(&mut self, signal: TradeSignal) {
        match self.manager.open_position(&signal, &self.ledger).await {
            Ok(Some(position)) => {
                self.ledger.record_open(position.cost_basis());
                self.positions.insert(position.id, position);
            }
            Ok(None) => {}
            Err(e) => {
                // Validation and broker failures are isolated to this signal
                warn!(symbol = %signal.symbol, error = %e, "Signal not tradeable");
            }
        }
    }

    /// Symbols that still need fresh snapshots, deduplicated.
    fn watched_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .positions
            .values()
            .filter(|p| !p.is_closed())
            .map(|p| p.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AlwaysOpen, PaperBroker, ScriptedFeed};
    use crate::models::{AgreementLevel, CloseReason, ExitState, MarketSnapshot};
    use crate::notify::{RecordingNotifier, TradeEvent};
    use crate::trading::config::RiskConfig;
    use crate::trading::PositionSizer;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct NeverOpen;

    impl TradingCalendar for NeverOpen {
        fn is_market_open(&self, _now: DateTime<Utc>) -> bool {
            false
        }
    }

    fn snapshot(symbol: &str, price: Decimal, minute: u32) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            price,
            volume: 500_000,
            volume_ratio: 1.0,
            momentum: 60.0,
            volatility: 0.0,
            as_of: Utc.with_ymd_and_hms(2024, 3, 5, 15, minute, 0).unwrap(),
        }
    }

    fn monitor_with<C: TradingCalendar>(
        feed: ScriptedFeed,
        calendar: C,
        cash: Decimal,
    ) -> (
        PositionMonitor<PaperBroker, ScriptedFeed, C, RecordingNotifier>,
        mpsc::Sender<TradeSignal>,
    ) {
        let config = RiskConfig::default();
        let (tx, rx) = mpsc::channel(16);

        let manager = TradeManager::new(
            PaperBroker::new(cash, Decimal::ZERO),
            RecordingNotifier::default(),
            PositionSizer::new(config.sizing.clone()),
            &config.exits,
            &config.retry,
        );

        let monitor = PositionMonitor::new(
            config.monitor.clone(),
            ExitEngine::new(config.exits.clone()),
            manager,
            feed,
            calendar,
            CapitalLedger::new(cash, config.sizing.cash_reserve_fraction),
            rx,
        );

        (monitor, tx)
    }

    fn signal(symbol: &str, entry: Decimal) -> TradeSignal {
        TradeSignal {
            symbol: symbol.to_string(),
            confidence: 0.997,
            agreement: AgreementLevel::Maximum,
            entry_price: entry,
            strategy: None,
            generated_at: Utc::now(),
        }
    }

    fn now_at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 15, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle_open_trail_stop_out() {
        let feed = ScriptedFeed::for_symbol(
            "AAPL",
            vec![
                snapshot("AAPL", dec!(50.30), 1), // arms breakeven
                snapshot("AAPL", dec!(51.50), 2), // trails to 50.985
                snapshot("AAPL", dec!(50.90), 3), // stop hit
            ],
        );
        let (mut monitor, tx) = monitor_with(feed, AlwaysOpen, dec!(10000));

        tx.send(signal("AAPL", dec!(50))).await.unwrap();
        monitor.tick(now_at(1)).await.unwrap();

        let position = monitor.open_positions().next().expect("position open");
        assert_eq!(position.exit_state, ExitState::BreakevenArmed);
        assert_eq!(position.stop_price, dec!(50.05));

        monitor.tick(now_at(2)).await.unwrap();
        let position = monitor.open_positions().next().unwrap();
        assert_eq!(position.exit_state, ExitState::Trailing);
        assert_eq!(position.stop_price, dec!(50.985));

        monitor.tick(now_at(3)).await.unwrap();
        assert_eq!(monitor.open_positions().count(), 0);

        // Sell proceeds landed back in the ledger with realized P&L
        assert!(monitor.ledger().realized_pnl() > Decimal::ZERO);
        assert_eq!(monitor.ledger().open_position_value(), Decimal::ZERO);
        assert_eq!(monitor.ledger().win_streak(), 1);

        let events = monitor.manager.notifier().events.lock().unwrap();
        let closed = events
            .iter()
            .find(|e| matches!(e, TradeEvent::PositionClosed { .. }))
            .expect("close event emitted");
        if let TradeEvent::PositionClosed { reason, .. } = closed {
            assert_eq!(*reason, CloseReason::StopHit);
        }
    }

    #[tokio::test]
    async fn test_missing_snapshot_holds_position_over() {
        // Tick 1 opens and arms; tick 2 has no data for AAPL
        let feed = ScriptedFeed::new(vec![
            HashMap::from([("AAPL".to_string(), snapshot("AAPL", dec!(50.30), 1))]),
            HashMap::new(),
        ]);
        let (mut monitor, tx) = monitor_with(feed, AlwaysOpen, dec!(10000));

        tx.send(signal("AAPL", dec!(50))).await.unwrap();
        monitor.tick(now_at(1)).await.unwrap();

        let before = monitor.open_positions().next().unwrap().clone();
        monitor.tick(now_at(2)).await.unwrap();
        let after = monitor.open_positions().next().expect("still registered");

        assert_eq!(after.exit_state, before.exit_state);
        assert_eq!(after.stop_price, before.stop_price);
        assert_eq!(after.current_price, before.current_price);
    }

    #[tokio::test]
    async fn test_closed_market_skips_evaluation() {
        let feed = ScriptedFeed::for_symbol("AAPL", vec![snapshot("AAPL", dec!(50.30), 1)]);
        let (mut monitor, tx) = monitor_with(feed, NeverOpen, dec!(10000));

        tx.send(signal("AAPL", dec!(50))).await.unwrap();
        monitor.tick(now_at(1)).await.unwrap();

        // The signal stayed queued and nothing was opened
        assert_eq!(monitor.open_positions().count(), 0);
        assert_eq!(monitor.ledger().total_cash(), dec!(10000));
    }

    #[tokio::test]
    async fn test_open_debits_ledger_and_registers() {
        let feed = ScriptedFeed::new(vec![HashMap::new()]);
        let (mut monitor, tx) = monitor_with(feed, AlwaysOpen, dec!(1000));

        tx.send(signal("AAPL", dec!(100))).await.unwrap();
        monitor.tick(now_at(1)).await.unwrap();

        // 900 available * 10% * 3.0 multiplier = 270 -> 2 shares at $100
        let position = monitor.open_positions().next().expect("opened");
        assert_eq!(position.quantity, 2);
        assert_eq!(monitor.ledger().open_position_value(), dec!(200));
        assert_eq!(monitor.ledger().total_cash(), dec!(800));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_run() {
        let feed = ScriptedFeed::new(vec![]);
        let (mut monitor, _tx) = monitor_with(feed, AlwaysOpen, dec!(1000));

        let shutdown = monitor.shutdown_signal();
        shutdown.store(true, Ordering::SeqCst);

        // Returns promptly instead of looping forever
        monitor.run().await.unwrap();
    }
}
