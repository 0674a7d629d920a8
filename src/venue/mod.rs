pub mod dydx;
pub mod mock;

pub use dydx::*;
pub use mock::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{AccountSnapshot, Candle, Instrument, Side, Timeframe};

/// A single trade printed by the venue's feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VenueTrade {
    pub price: Decimal,
    pub size: Decimal,
    pub at: DateTime<Utc>,
}

/// Confirmed execution of a market order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub filled_price: Decimal,
    pub filled_size: Decimal,
}

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("venue call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed venue payload: {0}")]
    Payload(String),
    #[error("order rejected: {0}")]
    OrderRejected(String),
}

/// Everything the bot needs from the venue. Networking, authentication and
/// wire formats live entirely behind this trait; the control loop only sees
/// candles, trades, account state and fills.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Most recent `limit` candles, ascending by start time. The last one
    /// may still be forming.
    async fn get_candles(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, VenueError>;

    /// One live subscription to the trade feed. The receiver ends when the
    /// connection drops; reconnecting is the caller's job.
    async fn subscribe_trades(
        &self,
        instrument: &Instrument,
    ) -> Result<mpsc::Receiver<VenueTrade>, VenueError>;

    async fn get_account(&self) -> Result<AccountSnapshot, VenueError>;

    /// Submit a market order and block until it fills. `client_id` is the
    /// caller-generated idempotency key; resubmissions reuse it.
    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        size_base: Decimal,
        client_id: &str,
    ) -> Result<Fill, VenueError>;

    /// Best-effort cancellation by client id.
    async fn cancel_order(&self, client_id: &str) -> Result<(), VenueError>;
}
