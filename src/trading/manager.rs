//! Trade manager: turns sizing results into open positions and exit
//! decisions into closes, with a bounded retry policy around broker calls.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::api::{Broker, OrderResult, OrderSide, OrderStatus};
use crate::errors::{EngineError, EngineResult};
use crate::models::{CloseReason, Position, TradeSignal};
use crate::notify::{Notifier, TradeEvent};

use super::config::{ExitConfig, RetryConfig};
use super::ledger::CapitalLedger;
use super::sizer::PositionSizer;

/// Explicit bounded-retry policy for broker transport failures.
///
/// Business-level rejections are not retried here; the open path gets one
/// reduced-size resize and the close path is retried every tick.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Opens and closes positions against the broker.
pub struct TradeManager<B, N> {
    broker: B,
    notifier: N,
    sizer: PositionSizer,
    retry: RetryPolicy,
    initial_target_pct: Decimal,
    reduced_size_factor: Decimal,
}

impl<B: Broker, N: Notifier> TradeManager<B, N> {
    pub fn new(
        broker: B,
        notifier: N,
        sizer: PositionSizer,
        exits: &ExitConfig,
        retry_config: &RetryConfig,
    ) -> Self {
        Self {
            broker,
            notifier,
            sizer,
            retry: RetryPolicy::from(retry_config),
            initial_target_pct: exits.take_profit_pct,
            reduced_size_factor: retry_config.reduced_size_factor,
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Current settled cash at the broker, with transport retry.
    pub async fn broker_cash(&self) -> EngineResult<Decimal> {
        self.with_transport_retry(|| self.broker.available_cash())
            .await
    }

    /// Size and open a position for `signal`. Sizing rejections and broker
    /// rejections both come back as `None`, already notified.
    pub async fn open_position(
        &self,
        signal: &TradeSignal,
        ledger: &CapitalLedger,
    ) -> EngineResult<Option<Position>> {
        let sized = self.sizer.size(signal, ledger)?;

        if let Some(rejection) = sized.rejection {
            self.notifier
                .notify(&TradeEvent::SizingRejected {
                    symbol: signal.symbol.clone(),
                    reason: rejection.as_str().to_string(),
                })
                .await;
            return Ok(None);
        }

        let mut quantity = sized.quantity;
        let order = match self.submit(signal, quantity).await? {
            Some(order) => Some(order),
            None => {
                // One retry at reduced size before giving up
                let reduced = (Decimal::from(quantity) * self.reduced_size_factor)
                    .floor()
                    .to_u64()
                    .unwrap_or(0);
                if reduced == 0 || reduced >= quantity {
                    None
                } else {
                    warn!(
                        symbol = %signal.symbol,
                        original = quantity,
                        reduced,
                        "Open order rejected; retrying at reduced size"
                    );
                    quantity = reduced;
                    self.submit(signal, reduced).await?
                }
            }
        };

        let Some(order) = order else {
            self.notifier
                .notify(&TradeEvent::SizingAbandoned {
                    symbol: signal.symbol.clone(),
                    reason: "broker rejected order at full and reduced size".to_string(),
                })
                .await;
            return Ok(None);
        };

        let fill_price = order.fill_price.unwrap_or(signal.entry_price);
        let target = fill_price * (Decimal::ONE + self.initial_target_pct);

        let mut opened_from = sized;
        opened_from.quantity = quantity;

        let position = Position::open(
            signal.symbol.clone(),
            signal.strategy.clone(),
            opened_from,
            fill_price,
            target,
            Utc::now(),
        );

        info!(
            symbol = %position.symbol,
            quantity = position.quantity,
            fill = %fill_price,
            target = %target,
            "Position opened"
        );

        self.notifier
            .notify(&TradeEvent::PositionOpened {
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                fill_price,
                target_value: position.opened_from.target_value,
            })
            .await;

        Ok(Some(position))
    }

    /// Close a position. A failed close is never an error: the attempt
    /// counter advances, an escalating alert fires, and the monitor retries
    /// next tick. Returns the fill price on success.
    pub async fn close_position(
        &self,
        position: &mut Position,
        reason: CloseReason,
    ) -> Option<Decimal> {
        let result = self
            .with_transport_retry(|| {
                self.broker.place_order(
                    &position.symbol,
                    OrderSide::Sell,
                    position.quantity,
                    position.current_price,
                )
            })
            .await;

        match result {
            Ok(OrderResult {
                status: OrderStatus::Filled,
                fill_price,
                ..
            }) => {
                let fill = fill_price.unwrap_or(position.current_price);
                let pnl_pct = position.profit_pct_at(fill);
                self.notifier
                    .notify(&TradeEvent::PositionClosed {
                        symbol: position.symbol.clone(),
                        reason,
                        fill_price: fill,
                        pnl_pct,
                    })
                    .await;
                Some(fill)
            }
            Ok(_) | Err(EngineError::OrderRejected(_)) => {
                position.close_attempts += 1;
                self.notifier
                    .notify(&TradeEvent::CloseRetry {
                        symbol: position.symbol.clone(),
                        reason,
                        attempts: position.close_attempts,
                    })
                    .await;
                None
            }
            Err(e) => {
                position.close_attempts += 1;
                warn!(symbol = %position.symbol, error = %e, "Close order transport failure");
                self.notifier
                    .notify(&TradeEvent::CloseRetry {
                        symbol: position.symbol.clone(),
                        reason,
                        attempts: position.close_attempts,
                    })
                    .await;
                None
            }
        }
    }

    /// Submit a buy. `Ok(None)` is a broker rejection (retryable at reduced
    /// size); pending orders that never confirm count as rejections too.
    async fn submit(&self, signal: &TradeSignal, quantity: u64) -> EngineResult<Option<OrderResult>> {
        let result = self
            .with_transport_retry(|| {
                self.broker.place_order(
                    &signal.symbol,
                    OrderSide::Buy,
                    quantity,
                    signal.entry_price,
                )
            })
            .await;

        match result {
            Ok(order) if order.status == OrderStatus::Filled => Ok(Some(order)),
            Ok(order) => {
                warn!(
                    symbol = %signal.symbol,
                    status = ?order.status,
                    order_id = ?order.order_id,
                    "Open order not filled"
                );
                Ok(None)
            }
            Err(EngineError::OrderRejected(reason)) => {
                warn!(symbol = %signal.symbol, reason = %reason, "Open order rejected");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a broker call under the bounded transport retry policy.
    async fn with_transport_retry<T, F, Fut>(&self, operation: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = EngineResult<T>>,
    {
        let attempts = AtomicU32::new(0);
        backoff::future::retry(self.retry.backoff(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = operation();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e @ EngineError::Transport(_)) if n < self.retry.max_attempts => {
                        warn!(attempt = n, error = %e, "Broker call failed; backing off");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }
}
