//! Data models for signals, positions, and market snapshots.

mod position;
mod signal;
mod snapshot;

pub use position::{CloseReason, ExitState, Position};
pub use signal::{AgreementLevel, PositionSizingResult, SizingRejection, TradeSignal};
pub use snapshot::MarketSnapshot;
