//! Bot wiring: builds the collaborators, owns the signal channel, and runs
//! the position monitor until shutdown.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::{
    Broker, HttpBroker, HttpMarketData, MarketData, PaperBroker, SessionCalendar, TradingCalendar,
};
use crate::models::TradeSignal;
use crate::monitor::PositionMonitor;
use crate::notify::{Alerts, Notifier};
use crate::trading::{CapitalLedger, ExitEngine, PositionSizer, RiskConfig, TradeManager};

const SIGNAL_QUEUE_DEPTH: usize = 256;

/// A fully wired trading session.
pub struct Bot<B, M, C, N> {
    monitor: PositionMonitor<B, M, C, N>,
    signals: mpsc::Sender<TradeSignal>,
}

/// Simulated-execution session.
pub type PaperBot = Bot<PaperBroker, HttpMarketData, SessionCalendar, Alerts>;

/// Live-execution session against the brokerage API.
pub type LiveBot = Bot<HttpBroker, HttpMarketData, SessionCalendar, Alerts>;

impl Bot<PaperBroker, HttpMarketData, SessionCalendar, Alerts> {
    /// Paper session: real market data, simulated fills.
    pub fn paper(config: RiskConfig, capital: Decimal, webhook: Option<String>) -> Result<PaperBot> {
        let broker = PaperBroker::new(capital, rust_decimal_macros::dec!(0.0005));
        let market_data = HttpMarketData::from_env()?;
        let ledger = CapitalLedger::new(capital, config.sizing.cash_reserve_fraction);

        info!(capital = %capital, "Paper session");
        Self::assemble(config, broker, market_data, SessionCalendar::default(), ledger, webhook)
    }
}

impl Bot<HttpBroker, HttpMarketData, SessionCalendar, Alerts> {
    /// Live session: broker credentials from the environment, starting cash
    /// from the account itself.
    pub async fn live(config: RiskConfig, webhook: Option<String>) -> Result<LiveBot> {
        let broker = HttpBroker::from_env()?;
        let cash = broker
            .available_cash()
            .await
            .context("Cannot read account cash from broker")?;
        let market_data = HttpMarketData::from_env()?;
        let ledger = CapitalLedger::new(cash, config.sizing.cash_reserve_fraction);

        info!(cash = %cash, "Live session");
        Self::assemble(config, broker, market_data, SessionCalendar::default(), ledger, webhook)
    }
}

impl<B, M, C> Bot<B, M, C, Alerts>
where
    B: Broker,
    M: MarketData,
    C: TradingCalendar,
{
    fn assemble(
        config: RiskConfig,
        broker: B,
        market_data: M,
        calendar: C,
        ledger: CapitalLedger,
        webhook: Option<String>,
    ) -> Result<Bot<B, M, C, Alerts>> {
        config.validate()?;

        let notifier = match webhook {
            Some(url) => Alerts::with_webhook(url)?,
            None => Alerts::log_only(),
        };

        let manager = TradeManager::new(
            broker,
            notifier,
            PositionSizer::new(config.sizing.clone()),
            &config.exits,
            &config.retry,
        );

        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let monitor = PositionMonitor::new(
            config.monitor.clone(),
            ExitEngine::new(config.exits),
            manager,
            market_data,
            calendar,
            ledger,
            rx,
        );

        Ok(Bot {
            monitor,
            signals: tx,
        })
    }
}

impl<B, M, C, N> Bot<B, M, C, N>
where
    B: Broker,
    M: MarketData,
    C: TradingCalendar,
    N: Notifier,
{
    /// Handle for external signal producers.
    pub fn signal_sender(&self) -> mpsc::Sender<TradeSignal> {
        self.signals.clone()
    }

    /// Read JSON-line signals from stdin and feed them to the monitor.
    /// The default signal source: pipe your strategy's output in.
    pub fn spawn_stdin_signals(&self) {
        let tx = self.signal_sender();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TradeSignal>(line) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Unparseable signal line"),
                }
            }
            info!("Signal input closed");
        });
    }

    /// Run until ctrl-c or an external shutdown.
    pub async fn run(mut self) -> Result<()> {
        let shutdown = self.monitor.shutdown_signal();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.monitor.run().await?;
        Ok(())
    }
}
