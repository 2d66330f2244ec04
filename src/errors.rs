//! Error taxonomy for the sizing and exit engine.
//!
//! The split matters for propagation policy: per-symbol and per-call errors
//! (`Validation`, `DataUnavailable`, `OrderRejected`) are isolated so one bad
//! symbol never halts the monitor loop, while `Configuration` fails fast
//! before the loop starts.

use thiserror::Error;

/// Errors surfaced by the trading core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad numeric input to sizing. Fatal to that call only.
    #[error("invalid sizing input: {0}")]
    Validation(String),

    /// One symbol's snapshot is missing. The position is held over to the
    /// next tick, not closed.
    #[error("market data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// The broker refused an order.
    #[error("order rejected by broker: {0}")]
    OrderRejected(String),

    /// Invalid thresholds or tier tables at startup.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Transport failure talking to a collaborator.
    #[error("broker/data transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
