use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitReason, Instrument, PositionSide};

/// An open long position. Immutable between open and close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub side: PositionSide,
    pub entry_price: Decimal,
    /// Quantity in base units; `size_usd / entry_price` after lot rounding.
    pub size_base: Decimal,
    /// Notional at entry.
    pub size_usd: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub opened_at: DateTime<Utc>,
    pub client_order_id: String,
    pub reasoning: String,
}

impl Position {
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.size_base
    }

    pub fn into_trade(self, exit_price: Decimal, reason: ExitReason, at: DateTime<Utc>) -> Trade {
        let pnl_usd = self.pnl_at(exit_price);
        Trade {
            instrument: self.instrument,
            side: self.side,
            entry_price: self.entry_price,
            size_base: self.size_base,
            size_usd: self.size_usd,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            opened_at: self.opened_at,
            exit_price,
            closed_at: at,
            exit_reason: reason,
            pnl_usd,
            reasoning: self.reasoning,
        }
    }
}

/// A closed position record. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: Instrument,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub size_base: Decimal,
    pub size_usd: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub opened_at: DateTime<Utc>,
    pub exit_price: Decimal,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub pnl_usd: Decimal,
    pub reasoning: String,
}

impl Trade {
    pub fn is_win(&self) -> bool {
        self.pnl_usd > Decimal::ZERO
    }
}
