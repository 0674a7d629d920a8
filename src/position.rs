use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::types::{ExitReason, Position, Trade};

#[derive(Debug, Error, PartialEq)]
pub enum PositionError {
    #[error("a position is already open")]
    AlreadyOpen,
    #[error("no position is open")]
    NoPosition,
}

/// Sole owner of the (at most one) open position. All access goes through
/// these methods; the held position is never mutated between open and close.
pub struct PositionManager {
    slot: RwLock<Option<Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    pub async fn open(&self, position: Position) -> Result<(), PositionError> {
        let mut slot = self.slot.write().await;
        if slot.is_some() {
            return Err(PositionError::AlreadyOpen);
        }
        info!(
            instrument = %position.instrument,
            entry = %position.entry_price,
            size = %position.size_base,
            stop_loss = %position.stop_loss,
            take_profit = %position.take_profit,
            "position opened"
        );
        *slot = Some(position);
        Ok(())
    }

    pub async fn current(&self) -> Option<Position> {
        self.slot.read().await.clone()
    }

    /// Stop-loss is checked before take-profit; touching a level exactly
    /// counts as a hit.
    pub async fn check_exit(&self, price: Decimal) -> Option<ExitReason> {
        let slot = self.slot.read().await;
        let position = slot.as_ref()?;
        if price <= position.stop_loss {
            Some(ExitReason::StopLoss)
        } else if price >= position.take_profit {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    pub async fn close(
        &self,
        price: Decimal,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> Result<Trade, PositionError> {
        let mut slot = self.slot.write().await;
        let position = slot.take().ok_or(PositionError::NoPosition)?;
        let trade = position.into_trade(price, reason, at);
        info!(
            instrument = %trade.instrument,
            exit = %trade.exit_price,
            reason = %trade.exit_reason,
            pnl = %trade.pnl_usd,
            "position closed"
        );
        Ok(trade)
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Instrument, PositionSide};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position {
            instrument: Instrument::from("ETH-USD"),
            side: PositionSide::Long,
            entry_price: dec!(101),
            size_base: dec!(0.99),
            size_usd: dec!(99.99),
            stop_loss: dec!(99),
            take_profit: dec!(107),
            opened_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            client_order_id: "c-1".to_string(),
            reasoning: String::new(),
        }
    }

    #[tokio::test]
    async fn at_most_one_position_is_held() {
        let manager = PositionManager::new();
        assert!(manager.current().await.is_none());

        manager.open(position()).await.unwrap();
        assert_eq!(manager.open(position()).await, Err(PositionError::AlreadyOpen));
        assert!(manager.current().await.is_some());

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        manager.close(dec!(99), ExitReason::StopLoss, at).await.unwrap();
        assert!(manager.current().await.is_none());
        assert_eq!(
            manager.close(dec!(99), ExitReason::StopLoss, at).await,
            Err(PositionError::NoPosition)
        );

        // The slot is free again after a close.
        manager.open(position()).await.unwrap();
    }

    #[tokio::test]
    async fn exit_levels_are_boundary_inclusive() {
        let manager = PositionManager::new();
        manager.open(position()).await.unwrap();

        assert_eq!(manager.check_exit(dec!(100.5)).await, None);
        assert_eq!(manager.check_exit(dec!(99.01)).await, None);
        // Touching the stop exactly is a stop-loss exit.
        assert_eq!(manager.check_exit(dec!(99)).await, Some(ExitReason::StopLoss));
        assert_eq!(manager.check_exit(dec!(98)).await, Some(ExitReason::StopLoss));
        assert_eq!(
            manager.check_exit(dec!(107)).await,
            Some(ExitReason::TakeProfit)
        );
        assert_eq!(
            manager.check_exit(dec!(107.2)).await,
            Some(ExitReason::TakeProfit)
        );
    }

    #[tokio::test]
    async fn close_produces_the_expected_trade() {
        let manager = PositionManager::new();
        manager.open(position()).await.unwrap();

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        let trade = manager
            .close(dec!(99), ExitReason::StopLoss, at)
            .await
            .unwrap();
        assert_eq!(trade.pnl_usd, (dec!(99) - dec!(101)) * dec!(0.99));
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.closed_at, at);
    }

    #[tokio::test]
    async fn no_exit_without_a_position() {
        let manager = PositionManager::new();
        assert_eq!(manager.check_exit(dec!(1)).await, None);
    }
}
