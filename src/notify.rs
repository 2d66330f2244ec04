//! Notification sink: lifecycle events emitted by the trade manager and the
//! monitor. Delivery is best-effort; a failed alert never blocks trading.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::models::CloseReason;

/// Lifecycle events the core emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradeEvent {
    PositionOpened {
        symbol: String,
        quantity: u64,
        fill_price: Decimal,
        target_value: Decimal,
    },
    PositionClosed {
        symbol: String,
        reason: CloseReason,
        fill_price: Decimal,
        pnl_pct: Decimal,
    },
    SizingRejected {
        symbol: String,
        reason: String,
    },
    SizingAbandoned {
        symbol: String,
        reason: String,
    },
    /// A close order failed again; `attempts` drives severity escalation so
    /// a stuck close is never silently dropped.
    CloseRetry {
        symbol: String,
        reason: CloseReason,
        attempts: u32,
    },
}

impl TradeEvent {
    /// Human-readable alert line for chat-style sinks.
    pub fn headline(&self) -> String {
        match self {
            TradeEvent::PositionOpened { symbol, quantity, fill_price, .. } => {
                format!("Opened {quantity} {symbol} @ {fill_price}")
            }
            TradeEvent::PositionClosed { symbol, reason, fill_price, pnl_pct } => {
                format!(
                    "Closed {symbol} @ {fill_price} ({}) P&L {:.2}%",
                    reason.as_str(),
                    pnl_pct * Decimal::ONE_HUNDRED
                )
            }
            TradeEvent::SizingRejected { symbol, reason } => {
                format!("Sizing rejected for {symbol}: {reason}")
            }
            TradeEvent::SizingAbandoned { symbol, reason } => {
                format!("Abandoned entry for {symbol}: {reason}")
            }
            TradeEvent::CloseRetry { symbol, reason, attempts } => {
                format!(
                    "Close for {symbol} ({}) failed, attempt {attempts}",
                    reason.as_str()
                )
            }
        }
    }
}

/// Notification contract.
pub trait Notifier {
    fn notify(&self, event: &TradeEvent) -> impl std::future::Future<Output = ()> + Send;
}

/// Default sink: structured logs, with severity escalating on repeated
/// close failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, event: &TradeEvent) {
        match event {
            TradeEvent::PositionOpened { .. } | TradeEvent::PositionClosed { .. } => {
                info!("{}", event.headline());
            }
            TradeEvent::SizingRejected { .. } => {
                info!("{}", event.headline());
            }
            TradeEvent::SizingAbandoned { .. } => {
                warn!("{}", event.headline());
            }
            TradeEvent::CloseRetry { attempts, .. } => {
                if *attempts >= 3 {
                    error!("{}", event.headline());
                } else {
                    warn!("{}", event.headline());
                }
            }
        }
    }
}

/// Composite sink used by the binary: always logs, optionally posts each
/// event as JSON to a chat webhook.
pub struct Alerts {
    log: LogNotifier,
    webhook: Option<Webhook>,
}

struct Webhook {
    http: reqwest::Client,
    url: String,
}

impl Alerts {
    pub fn log_only() -> Self {
        Self {
            log: LogNotifier,
            webhook: None,
        }
    }

    pub fn with_webhook(url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            log: LogNotifier,
            webhook: Some(Webhook { http, url }),
        })
    }
}

impl Notifier for Alerts {
    async fn notify(&self, event: &TradeEvent) {
        self.log.notify(event).await;

        if let Some(webhook) = &self.webhook {
            let body = serde_json::json!({
                "text": event.headline(),
                "payload": event,
            });
            if let Err(e) = webhook.http.post(&webhook.url).json(&body).send().await {
                warn!(error = %e, "Webhook alert delivery failed");
            }
        }
    }
}

/// Test sink that records every event it receives.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: std::sync::Mutex<Vec<TradeEvent>>,
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &TradeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
