use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::BotConfig;
use crate::strategy::EntryPlan;
use crate::types::{AccountSnapshot, Trade};

/// Why the pre-trade gate refused an entry. Each check has its own reason;
/// the gate is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskDenial {
    #[error("entry notional ${requested} exceeds the ${cap} per-position cap")]
    PositionTooLarge { requested: Decimal, cap: Decimal },
    #[error("free collateral ${free} is below the ${required} margin requirement")]
    InsufficientCollateral { free: Decimal, required: Decimal },
    #[error("circuit breaker is tripped for the rest of the trading day")]
    CircuitBroken,
}

#[derive(Debug, Clone)]
struct RiskState {
    initial_equity: Option<Decimal>,
    last_equity: Option<Decimal>,
    daily_pnl: Decimal,
    last_reset_day: NaiveDate,
    tripped: bool,
}

/// Pre-trade gate plus the daily circuit breaker.
///
/// `daily_pnl` accumulates closed-trade PnL and resets at the UTC day
/// boundary. Drawdown is measured from the first equity reading against the
/// latest account snapshot; open positions are not marked to market, which
/// keeps the breaker from flapping.
pub struct RiskManager {
    max_position_size_usd: Decimal,
    max_daily_loss_usd: Decimal,
    max_drawdown_pct: Decimal,
    max_leverage: Decimal,
    clock: Arc<dyn Clock>,
    state: RwLock<RiskState>,
}

impl RiskManager {
    pub fn new(config: &BotConfig, clock: Arc<dyn Clock>) -> Self {
        let today = clock.today_utc();
        Self {
            max_position_size_usd: config.max_position_size_usd,
            max_daily_loss_usd: config.max_daily_loss_usd,
            max_drawdown_pct: config.max_drawdown_pct,
            max_leverage: config.max_leverage,
            clock,
            state: RwLock::new(RiskState {
                initial_equity: None,
                last_equity: None,
                daily_pnl: Decimal::ZERO,
                last_reset_day: today,
                tripped: false,
            }),
        }
    }

    fn drawdown_breached(&self, state: &RiskState) -> bool {
        let (Some(initial), Some(current)) = (state.initial_equity, state.last_equity) else {
            return false;
        };
        if initial <= Decimal::ZERO {
            return false;
        }
        let drawdown_pct = (initial - current) / initial * dec!(100);
        drawdown_pct > self.max_drawdown_pct
    }

    fn roll_day(&self, state: &mut RiskState) {
        let today = self.clock.today_utc();
        if today != state.last_reset_day {
            state.daily_pnl = Decimal::ZERO;
            state.last_reset_day = today;
            let still_down = self.drawdown_breached(state);
            if state.tripped && !still_down {
                info!("new trading day, circuit breaker reset");
            }
            state.tripped = still_down;
        }
    }

    fn trip_if_needed(&self, state: &mut RiskState) {
        if state.tripped {
            return;
        }
        if state.daily_pnl.abs() >= self.max_daily_loss_usd {
            warn!(
                daily_pnl = %state.daily_pnl,
                limit = %self.max_daily_loss_usd,
                "daily PnL limit reached, circuit breaker tripped"
            );
            state.tripped = true;
        } else if self.drawdown_breached(state) {
            warn!(
                initial_equity = %state.initial_equity.unwrap_or_default(),
                equity = %state.last_equity.unwrap_or_default(),
                limit_pct = %self.max_drawdown_pct,
                "drawdown limit exceeded, circuit breaker tripped"
            );
            state.tripped = true;
        }
    }

    /// Record the latest equity reading. The first successful reading
    /// becomes the drawdown baseline.
    pub async fn observe_account(&self, account: &AccountSnapshot) {
        let mut state = self.state.write().await;
        self.roll_day(&mut state);
        if state.initial_equity.is_none() {
            state.initial_equity = Some(account.equity_usd);
            info!(equity = %account.equity_usd, "initial equity captured");
        }
        state.last_equity = Some(account.equity_usd);
        self.trip_if_needed(&mut state);
    }

    /// The pre-trade gate: size cap, collateral requirement, breaker.
    pub async fn allow_entry(
        &self,
        plan: &EntryPlan,
        account: &AccountSnapshot,
    ) -> Result<(), RiskDenial> {
        let mut state = self.state.write().await;
        self.roll_day(&mut state);
        if state.initial_equity.is_none() {
            state.initial_equity = Some(account.equity_usd);
        }
        state.last_equity = Some(account.equity_usd);
        self.trip_if_needed(&mut state);

        if plan.size_usd > self.max_position_size_usd {
            return Err(RiskDenial::PositionTooLarge {
                requested: plan.size_usd,
                cap: self.max_position_size_usd,
            });
        }

        let required = plan.size_usd / self.max_leverage;
        if account.free_collateral_usd < required {
            return Err(RiskDenial::InsufficientCollateral {
                free: account.free_collateral_usd,
                required,
            });
        }

        if state.tripped {
            return Err(RiskDenial::CircuitBroken);
        }

        Ok(())
    }

    /// Fold one closed trade's PnL into the daily counter.
    pub async fn update_daily_pnl(&self, delta: Decimal) {
        let mut state = self.state.write().await;
        self.roll_day(&mut state);
        state.daily_pnl += delta;
        self.trip_if_needed(&mut state);
    }

    /// Rebuild today's PnL from persisted trades at start-up. Returns
    /// whether the breaker is already tripped.
    pub async fn rehydrate(&self, trades: &[Trade]) -> bool {
        let today = self.clock.today_utc();
        let replayed: Decimal = trades
            .iter()
            .filter(|t| t.closed_at.date_naive() == today)
            .map(|t| t.pnl_usd)
            .sum();

        let mut state = self.state.write().await;
        state.daily_pnl = replayed;
        state.last_reset_day = today;
        self.trip_if_needed(&mut state);
        if !replayed.is_zero() {
            info!(daily_pnl = %replayed, tripped = state.tripped, "replayed same-day trades");
        }
        state.tripped
    }

    pub async fn is_tripped(&self) -> bool {
        let mut state = self.state.write().await;
        self.roll_day(&mut state);
        state.tripped
    }

    pub async fn daily_pnl(&self) -> Decimal {
        self.state.read().await.daily_pnl
    }
}
