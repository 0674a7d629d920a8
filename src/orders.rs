use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::BotConfig;
use crate::position::{PositionError, PositionManager};
use crate::risk::{RiskDenial, RiskManager};
use crate::store::TradeStore;
use crate::strategy::EntryPlan;
use crate::types::{
    AccountSnapshot, ExitReason, Instrument, Position, PositionSide, Side, Trade, TradingMode,
};
use crate::venue::{Fill, VenueClient, VenueError};

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("venue: {0}")]
    Venue(#[from] VenueError),
    #[error("no fill confirmation within {0:?}")]
    FillTimeout(Duration),
    #[error("size {size} rounds to zero at lot {lot}")]
    ZeroSize { size: Decimal, lot: Decimal },
    #[error(transparent)]
    Position(#[from] PositionError),
}

#[derive(Debug)]
pub enum OpenOutcome {
    Opened(Position),
    Rejected(RiskDenial),
}

/// Simulated margin account, seeded from configuration so the risk gate
/// sees realistic equity and collateral without a venue.
struct SimAccount {
    equity: Decimal,
    reserved: Decimal,
    max_leverage: Decimal,
}

impl SimAccount {
    fn snapshot(&self) -> AccountSnapshot {
        AccountSnapshot {
            equity_usd: self.equity,
            free_collateral_usd: (self.equity - self.reserved).max(Decimal::ZERO),
        }
    }

    fn reserve(&mut self, size_usd: Decimal) {
        self.reserved += size_usd / self.max_leverage;
    }

    fn release(&mut self, size_usd: Decimal, pnl: Decimal) {
        self.reserved = (self.reserved - size_usd / self.max_leverage).max(Decimal::ZERO);
        self.equity += pnl;
    }
}

/// Order lifecycle in either simulation or live mode. The caller-visible
/// behaviour is identical; only live mode talks to the venue.
///
/// Closing is one logical step: the position transition, the trade-store
/// append and the daily-PnL update happen here back to back. A failed append
/// is logged and swallowed — the position is still closed, the venue holds
/// financial truth.
pub struct OrderManager {
    mode: TradingMode,
    venue: Arc<dyn VenueClient>,
    positions: Arc<PositionManager>,
    risk: Arc<RiskManager>,
    store: Arc<TradeStore>,
    clock: Arc<dyn Clock>,
    instrument: Instrument,
    lot_size: Decimal,
    order_timeout: Duration,
    query_timeout: Duration,
    sim: Mutex<SimAccount>,
}

impl OrderManager {
    pub fn new(
        config: &BotConfig,
        venue: Arc<dyn VenueClient>,
        positions: Arc<PositionManager>,
        risk: Arc<RiskManager>,
        store: Arc<TradeStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mode = if config.simulation_mode {
            TradingMode::Simulation
        } else {
            TradingMode::Live
        };
        Self {
            mode,
            venue,
            positions,
            risk,
            store,
            clock,
            instrument: config.instrument.clone(),
            lot_size: config.lot_size,
            order_timeout: Duration::from_secs(config.order_timeout_s),
            query_timeout: Duration::from_secs(config.query_timeout_s),
            sim: Mutex::new(SimAccount {
                equity: config.initial_equity_usd,
                reserved: Decimal::ZERO,
                max_leverage: config.max_leverage,
            }),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    /// Account state as the risk gate should see it: the simulated ledger in
    /// simulation mode, the venue's subaccount otherwise.
    pub async fn account_snapshot(&self) -> Result<AccountSnapshot, OrderError> {
        match self.mode {
            TradingMode::Simulation => Ok(self.sim.lock().await.snapshot()),
            TradingMode::Live => {
                let snapshot =
                    tokio::time::timeout(self.query_timeout, self.venue.get_account())
                        .await
                        .map_err(|_| VenueError::Timeout(self.query_timeout))??;
                Ok(snapshot)
            }
        }
    }

    pub async fn open_long(&self, plan: EntryPlan) -> Result<OpenOutcome, OrderError> {
        let account = self.account_snapshot().await?;
        if let Err(denial) = self.risk.allow_entry(&plan, &account).await {
            info!(reason = %denial, "entry rejected by risk gate");
            return Ok(OpenOutcome::Rejected(denial));
        }

        let raw_size = plan.size_usd / plan.entry_price;
        let size_base = round_down_to_lot(raw_size, self.lot_size);
        if size_base <= Decimal::ZERO {
            return Err(OrderError::ZeroSize {
                size: raw_size,
                lot: self.lot_size,
            });
        }

        let client_id = Uuid::new_v4().to_string();
        let fill = self
            .execute(Side::Buy, size_base, &client_id, plan.entry_price)
            .await?;

        let size_usd = fill.filled_price * fill.filled_size;
        let position = Position {
            instrument: self.instrument.clone(),
            side: PositionSide::Long,
            entry_price: fill.filled_price,
            size_base: fill.filled_size,
            size_usd,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            opened_at: self.clock.now(),
            client_order_id: client_id,
            reasoning: plan.reasoning,
        };

        if self.mode == TradingMode::Simulation {
            self.sim.lock().await.reserve(size_usd);
        }

        self.positions.open(position.clone()).await?;
        Ok(OpenOutcome::Opened(position))
    }

    pub async fn close(&self, price: Decimal, reason: ExitReason) -> Result<Trade, OrderError> {
        let position = self
            .positions
            .current()
            .await
            .ok_or(PositionError::NoPosition)?;

        let client_id = Uuid::new_v4().to_string();
        let fill = self
            .execute(Side::Sell, position.size_base, &client_id, price)
            .await?;

        let trade = self
            .positions
            .close(fill.filled_price, reason, self.clock.now())
            .await?;

        if self.mode == TradingMode::Simulation {
            self.sim.lock().await.release(trade.size_usd, trade.pnl_usd);
        }

        if let Err(e) = self.store.append(&trade) {
            error!(error = %e, "failed to persist closed trade; venue remains authoritative");
        }
        self.risk.update_daily_pnl(trade.pnl_usd).await;
        self.store.clear_open_position();

        Ok(trade)
    }

    /// In simulation a fill is synthesised at the observed price; live mode
    /// submits a market order under a fresh idempotency key and waits out
    /// the fill window.
    async fn execute(
        &self,
        side: Side,
        size_base: Decimal,
        client_id: &str,
        observed_price: Decimal,
    ) -> Result<Fill, OrderError> {
        match self.mode {
            TradingMode::Simulation => {
                info!(
                    %side,
                    size = %size_base,
                    price = %observed_price,
                    client_id,
                    "simulated fill"
                );
                Ok(Fill {
                    filled_price: observed_price,
                    filled_size: size_base,
                })
            }
            TradingMode::Live => {
                let placed = tokio::time::timeout(
                    self.order_timeout,
                    self.venue
                        .place_market_order(&self.instrument, side, size_base, client_id),
                )
                .await;
                match placed {
                    Ok(result) => result.map_err(OrderError::Venue),
                    Err(_) => {
                        let _ = self.venue.cancel_order(client_id).await;
                        Err(OrderError::FillTimeout(self.order_timeout))
                    }
                }
            }
        }
    }
}

fn round_down_to_lot(size: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return size;
    }
    (size / lot).floor() * lot
}
