use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::BotConfig;
use crate::market::{MarketData, MarketError};
use crate::orders::{OpenOutcome, OrderManager};
use crate::position::PositionManager;
use crate::risk::RiskManager;
use crate::store::{StoreError, TradeStore};
use crate::strategy::{BreakoutStrategy, Signal};
use crate::types::ExitReason;
use crate::venue::VenueClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotPhase {
    Initialising,
    Running,
    Reconnecting,
    CircuitBroken,
    Stopping,
    Stopped,
}

impl fmt::Display for BotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BotPhase::Initialising => "Initialising",
            BotPhase::Running => "Running",
            BotPhase::Reconnecting => "Reconnecting",
            BotPhase::CircuitBroken => "CircuitBroken",
            BotPhase::Stopping => "Stopping",
            BotPhase::Stopped => "Stopped",
        };
        write!(f, "{}", s)
    }
}

/// Start-up failures that map onto process exit codes.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("venue connectivity failed to initialise: {0}")]
    Venue(#[from] MarketError),
    #[error("circuit breaker already tripped by replayed same-day trades")]
    CircuitBroken,
    #[error("trade store: {0}")]
    Store(#[from] StoreError),
}

/// The control loop. Each tick takes one market view, checks exits on any
/// held position first, and only with no position consults the strategy and
/// routes a candidate entry through the risk-gated order path. No error
/// escapes the loop.
pub struct Bot {
    config: BotConfig,
    market: Arc<MarketData>,
    strategy: BreakoutStrategy,
    positions: Arc<PositionManager>,
    risk: Arc<RiskManager>,
    orders: Arc<OrderManager>,
    store: Arc<TradeStore>,
    phase: BotPhase,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        venue: Arc<dyn VenueClient>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StartupError> {
        let store = Arc::new(TradeStore::open(&config.data_dir)?);
        let market = Arc::new(MarketData::new(
            &config,
            Arc::clone(&venue),
            Arc::clone(&clock),
        ));
        let positions = Arc::new(PositionManager::new());
        let risk = Arc::new(RiskManager::new(&config, Arc::clone(&clock)));
        let orders = Arc::new(OrderManager::new(
            &config,
            venue,
            Arc::clone(&positions),
            Arc::clone(&risk),
            Arc::clone(&store),
            clock,
        ));
        let strategy = BreakoutStrategy::new(&config);

        Ok(Self {
            config,
            market,
            strategy,
            positions,
            risk,
            orders,
            store,
            phase: BotPhase::Initialising,
        })
    }

    /// Replay persisted trades into the risk state, take the first snapshot,
    /// restore any carried position and start the stream task.
    pub async fn start(&mut self) -> Result<(), StartupError> {
        info!(
            instrument = %self.config.instrument,
            timeframe = %self.config.timeframe,
            mode = %self.orders.mode(),
            "starting bot"
        );

        let history = self.store.load_all();
        if self.risk.rehydrate(&history).await {
            return Err(StartupError::CircuitBroken);
        }

        self.market.snapshot().await?;

        if let Some(position) = self.store.load_open_position() {
            info!(
                instrument = %position.instrument,
                entry = %position.entry_price,
                "restoring persisted open position"
            );
            if let Err(e) = self.positions.open(position).await {
                warn!(error = %e, "could not restore persisted position");
            }
        }

        Arc::clone(&self.market).spawn_stream();
        self.set_phase(BotPhase::Running);
        Ok(())
    }

    /// Run until SIGINT/SIGTERM, then wind down.
    pub async fn run(&mut self) -> Result<(), StartupError> {
        self.start().await?;

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.update_interval_s));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown_signal() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn tick(&mut self) {
        let view = self.market.current_market_view().await;
        self.refresh_phase().await;

        // Exits are checked before entries; a stop hit and a fresh entry
        // never share a tick.
        if self.positions.current().await.is_some() {
            let Some(price) = view.latest_price else {
                return;
            };
            if let Some(reason) = self.positions.check_exit(price).await {
                match self.orders.close(price, reason).await {
                    Ok(trade) => {
                        info!(
                            reason = %trade.exit_reason,
                            exit = %trade.exit_price,
                            pnl = %trade.pnl_usd,
                            "exit filled"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "close failed, retrying on the next tick");
                    }
                }
            }
            return;
        }

        match self.strategy.evaluate(&view) {
            Signal::EnterLong(plan) => {
                info!(
                    entry = %plan.entry_price,
                    stop_loss = %plan.stop_loss,
                    take_profit = %plan.take_profit,
                    reason = %plan.reasoning,
                    "entry signal"
                );
                match self.orders.open_long(plan).await {
                    Ok(OpenOutcome::Opened(_)) => {}
                    Ok(OpenOutcome::Rejected(_)) => {
                        // Denial already logged with its reason by the gate.
                    }
                    Err(e) => {
                        error!(error = %e, "order placement failed, awaiting the next signal");
                    }
                }
            }
            Signal::NoSignal => {}
        }
    }

    async fn refresh_phase(&mut self) {
        if matches!(self.phase, BotPhase::Stopping | BotPhase::Stopped) {
            return;
        }
        let next = if self.risk.is_tripped().await {
            BotPhase::CircuitBroken
        } else if !self.market.is_connected().await {
            BotPhase::Reconnecting
        } else {
            BotPhase::Running
        };
        self.set_phase(next);
    }

    fn set_phase(&mut self, next: BotPhase) {
        if self.phase == next {
            return;
        }
        match next {
            BotPhase::CircuitBroken | BotPhase::Reconnecting => {
                warn!(from = %self.phase, to = %next, "bot state changed");
            }
            _ => info!(from = %self.phase, to = %next, "bot state changed"),
        }
        self.phase = next;
    }

    async fn shutdown(&mut self) {
        self.set_phase(BotPhase::Stopping);

        if let Some(position) = self.positions.current().await {
            if self.config.keep_position_on_shutdown {
                match self.store.save_open_position(&position) {
                    Ok(()) => info!("open position persisted for restart"),
                    Err(e) => error!(error = %e, "failed to persist open position"),
                }
            } else {
                let view = self.market.current_market_view().await;
                let price = view.latest_price.unwrap_or(position.entry_price);
                let grace = Duration::from_secs(self.config.shutdown_grace_s);
                match tokio::time::timeout(
                    grace,
                    self.orders.close(price, ExitReason::Shutdown),
                )
                .await
                {
                    Ok(Ok(trade)) => {
                        info!(pnl = %trade.pnl_usd, "position closed on shutdown");
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "shutdown close failed, persisting position instead");
                        let _ = self.store.save_open_position(&position);
                    }
                    Err(_) => {
                        error!("shutdown close not confirmed within grace period, persisting position");
                        let _ = self.store.save_open_position(&position);
                    }
                }
            }
        }

        if let Err(e) = self.store.flush() {
            error!(error = %e, "failed to flush trade store");
        }
        if let Err(e) = self.store.write_performance() {
            warn!(error = %e, "failed to write final performance snapshot");
        }
        self.set_phase(BotPhase::Stopped);
    }

    pub fn phase(&self) -> BotPhase {
        self.phase
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
