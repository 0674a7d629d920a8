use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Instrument;

/// Read-only snapshot of the market handed to the strategy each tick.
///
/// `resistance_level` is `None` until at least one candle has sealed;
/// together with a zero `average_volume` that reads as "not ready" and
/// suppresses entries.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketView {
    pub instrument: Instrument,
    pub latest_price: Option<Decimal>,
    /// Highest high over the resistance lookback of sealed candles.
    pub resistance_level: Option<Decimal>,
    /// Mean volume over the volume lookback of sealed candles.
    pub average_volume: Decimal,
    /// Volume accumulated so far in the currently forming candle.
    pub current_volume: Decimal,
    pub closed_candles: usize,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity_usd: Decimal,
    pub free_collateral_usd: Decimal,
}
