//! stocksentry: equity trading bot with confidence-based position sizing
//! and stealth exit management.
//!
//! Stops and targets are tracked internally and never rested on the
//! broker's book.

mod api;
mod bot;
mod errors;
mod models;
mod monitor;
mod notify;
mod trading;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::bot::Bot;
use crate::models::{AgreementLevel, TradeSignal};
use crate::trading::{CapitalLedger, PositionSizer, RiskConfig};

/// Equity trading bot CLI.
#[derive(Parser)]
#[command(name = "stocksentry")]
#[command(about = "Size positions from signal confidence and manage stealth exits", long_about = None)]
struct Cli {
    /// Risk configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor loop, reading JSON-line signals from stdin
    Run {
        /// Starting capital for a paper session
        #[arg(short = 'p', long, default_value = "10000")]
        capital: f64,

        /// Override the tick interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Execute real orders instead of the paper simulator
        #[arg(long)]
        live: bool,

        /// Chat webhook URL for alerts
        #[arg(long, env = "ALERT_WEBHOOK_URL")]
        webhook: Option<String>,
    },

    /// Preview the sizer's output for a hypothetical signal
    Size {
        /// Ticker symbol
        symbol: String,

        /// Signal confidence in [0, 1]
        #[arg(short = 'n', long)]
        confidence: f64,

        /// Agreement level (NONE, LOW, MEDIUM, HIGH, MAXIMUM)
        #[arg(short, long, default_value = "NONE")]
        agreement: AgreementLevel,

        /// Entry price
        #[arg(short, long)]
        price: f64,

        /// Available capital to size against
        #[arg(long, default_value = "10000")]
        capital: f64,

        /// Strategy tag for per-strategy caps
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => RiskConfig::from_file(path)?,
        None => RiskConfig::default(),
    };
    config.validate()?;

    match cli.command {
        Commands::Run {
            capital,
            interval,
            live,
            webhook,
        } => {
            if let Some(secs) = interval {
                config.monitor.tick_interval_secs = secs;
                config.validate()?;
            }

            if live {
                let bot = Bot::live(config, webhook).await?;
                bot.spawn_stdin_signals();
                bot.run().await?;
            } else {
                let capital = Decimal::try_from(capital)?;
                let bot = Bot::paper(config, capital, webhook)?;
                bot.spawn_stdin_signals();
                bot.run().await?;
            }
        }

        Commands::Size {
            symbol,
            confidence,
            agreement,
            price,
            capital,
            strategy,
        } => {
            let sizer = PositionSizer::new(config.sizing.clone());
            let ledger = CapitalLedger::new(
                Decimal::try_from(capital)?,
                config.sizing.cash_reserve_fraction,
            );
            let signal = TradeSignal {
                symbol: symbol.clone(),
                confidence,
                agreement,
                entry_price: Decimal::try_from(price)?,
                strategy,
                generated_at: chrono::Utc::now(),
            };

            let result = sizer.size(&signal, &ledger)?;

            println!("Symbol:         {symbol}");
            println!("Agreement:      {}", signal.agreement.as_str());
            println!("Available:      ${}", ledger.available_trading_capital());
            println!("Multiplier:     {:.4}x", result.applied_multiplier);
            println!("Target value:   ${}", result.target_value.round_dp(2));
            println!("Quantity:       {}", result.quantity);
            println!("Capped:         {}", result.capped);
            match result.rejection {
                Some(reason) => println!("Rejected:       {}", reason.as_str()),
                None => println!("Rejected:       no"),
            }
        }

        Commands::Config => {
            info!("Effective risk configuration");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
