#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::types::{AccountSnapshot, Candle, Instrument, Side, Timeframe};
use super::{Fill, VenueClient, VenueError, VenueTrade};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub instrument: Instrument,
    pub side: Side,
    pub size_base: Decimal,
    pub client_id: String,
}

/// Deterministic in-memory venue for tests and dry runs.
///
/// Candles, account state and fill behaviour are scripted up front; trades
/// are pushed into the live subscription by hand, and dropping the feed
/// simulates a disconnect.
pub struct MockVenue {
    candles: Mutex<Vec<Candle>>,
    account: Mutex<AccountSnapshot>,
    fill_price: Mutex<Option<Decimal>>,
    fill_delay: Mutex<Duration>,
    feed: Mutex<Option<mpsc::Sender<VenueTrade>>>,
    orders: Mutex<Vec<RecordedOrder>>,
    cancellations: Mutex<Vec<String>>,
    candle_requests: Mutex<u32>,
}

impl MockVenue {
    pub fn new() -> Self {
        Self {
            candles: Mutex::new(Vec::new()),
            account: Mutex::new(AccountSnapshot {
                equity_usd: dec!(10000),
                free_collateral_usd: dec!(10000),
            }),
            fill_price: Mutex::new(None),
            fill_delay: Mutex::new(Duration::ZERO),
            feed: Mutex::new(None),
            orders: Mutex::new(Vec::new()),
            cancellations: Mutex::new(Vec::new()),
            candle_requests: Mutex::new(0),
        }
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        *self.candles.lock().unwrap() = candles;
    }

    pub fn set_account(&self, account: AccountSnapshot) {
        *self.account.lock().unwrap() = account;
    }

    /// Orders fill at this price; `None` makes every submission fail.
    pub fn set_fill_price(&self, price: Option<Decimal>) {
        *self.fill_price.lock().unwrap() = price;
    }

    pub fn set_fill_delay(&self, delay: Duration) {
        *self.fill_delay.lock().unwrap() = delay;
    }

    /// Feed one trade print into the active subscription.
    pub async fn push_trade(&self, price: Decimal, size: Decimal, at: DateTime<Utc>) {
        let sender = self.feed.lock().unwrap().clone();
        if let Some(tx) = sender {
            let _ = tx.send(VenueTrade { price, size, at }).await;
        }
    }

    /// Drop the live feed, ending the subscriber's receiver.
    pub fn disconnect_feed(&self) {
        self.feed.lock().unwrap().take();
    }

    pub fn recorded_orders(&self) -> Vec<RecordedOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn recorded_cancellations(&self) -> Vec<String> {
        self.cancellations.lock().unwrap().clone()
    }

    pub fn candle_request_count(&self) -> u32 {
        *self.candle_requests.lock().unwrap()
    }
}

impl Default for MockVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VenueClient for MockVenue {
    async fn get_candles(
        &self,
        _instrument: &Instrument,
        _timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, VenueError> {
        *self.candle_requests.lock().unwrap() += 1;
        let candles = self.candles.lock().unwrap().clone();
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles.into_iter().skip(skip).collect())
    }

    async fn subscribe_trades(
        &self,
        _instrument: &Instrument,
    ) -> Result<mpsc::Receiver<VenueTrade>, VenueError> {
        let (tx, rx) = mpsc::channel(64);
        *self.feed.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn get_account(&self) -> Result<AccountSnapshot, VenueError> {
        Ok(*self.account.lock().unwrap())
    }

    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        size_base: Decimal,
        client_id: &str,
    ) -> Result<Fill, VenueError> {
        self.orders.lock().unwrap().push(RecordedOrder {
            instrument: instrument.clone(),
            side,
            size_base,
            client_id: client_id.to_string(),
        });

        let delay = *self.fill_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        match *self.fill_price.lock().unwrap() {
            Some(price) => Ok(Fill {
                filled_price: price,
                filled_size: size_base,
            }),
            None => Err(VenueError::OrderRejected(
                "mock venue has no fill price scripted".to_string(),
            )),
        }
    }

    async fn cancel_order(&self, client_id: &str) -> Result<(), VenueError> {
        self.cancellations
            .lock()
            .unwrap()
            .push(client_id.to_string());
        Ok(())
    }
}
