//! External collaborator clients: broker execution, market data, and the
//! market-hours calendar.

mod broker;
mod calendar;
mod market_data;

pub use broker::{Broker, HttpBroker, OrderResult, OrderSide, OrderStatus, PaperBroker};
pub use calendar::{AlwaysOpen, SessionCalendar, TradingCalendar};
pub use market_data::{HttpMarketData, MarketData, ScriptedFeed};
