use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::BotConfig;
use crate::types::{CandleStore, Instrument, MarketView, SnapshotError, Timeframe};
use crate::venue::{VenueClient, VenueError, VenueTrade};

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("venue: {0}")]
    Venue(#[from] VenueError),
    #[error("snapshot rejected: {0}")]
    Snapshot(#[from] SnapshotError),
}

struct MarketState {
    store: CandleStore,
    latest_price: Option<Decimal>,
    connected: bool,
}

/// Keeps one instrument's candle history and latest price fresh from two
/// sources: REST snapshots (at start, after every reconnect, and on a
/// periodic safety net) and the live trade feed folded into the forming
/// candle. Readers get copies; the single lock is never held across awaits
/// on the venue.
pub struct MarketData {
    venue: Arc<dyn VenueClient>,
    clock: Arc<dyn Clock>,
    instrument: Instrument,
    timeframe: Timeframe,
    resistance_periods: usize,
    volume_lookback: usize,
    candle_history: u32,
    snapshot_interval: Duration,
    query_timeout: Duration,
    state: RwLock<MarketState>,
}

impl MarketData {
    pub fn new(config: &BotConfig, venue: Arc<dyn VenueClient>, clock: Arc<dyn Clock>) -> Self {
        let store = CandleStore::new(
            config.instrument.clone(),
            config.timeframe,
            config.candle_history as usize,
        );
        Self {
            venue,
            clock,
            instrument: config.instrument.clone(),
            timeframe: config.timeframe,
            resistance_periods: config.resistance_periods,
            volume_lookback: config.volume_lookback,
            candle_history: config.candle_history,
            snapshot_interval: Duration::from_secs(config.snapshot_interval_s),
            query_timeout: Duration::from_secs(config.query_timeout_s),
            state: RwLock::new(MarketState {
                store,
                latest_price: None,
                connected: false,
            }),
        }
    }

    /// Fetch a fresh candle history and atomically replace the store.
    pub async fn snapshot(&self) -> Result<(), MarketError> {
        let candles = tokio::time::timeout(
            self.query_timeout,
            self.venue
                .get_candles(&self.instrument, self.timeframe, self.candle_history),
        )
        .await
        .map_err(|_| VenueError::Timeout(self.query_timeout))??;

        let fetched = candles.len();
        let mut state = self.state.write().await;
        let last_close = candles.last().map(|c| c.close);
        state.store.load_snapshot(candles, self.clock.now())?;
        if state.latest_price.is_none() {
            state.latest_price = last_close;
        }
        debug!(
            instrument = %self.instrument,
            candles = fetched,
            closed = state.store.closed_len(),
            "candle snapshot loaded"
        );
        Ok(())
    }

    /// Run the stream path forever: subscribe, re-snapshot to close the gap,
    /// apply trades, and on any disconnect retry with exponential backoff
    /// (1s doubling to a 30s cap).
    pub fn spawn_stream(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run_stream().await })
    }

    async fn run_stream(&self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.venue.subscribe_trades(&self.instrument).await {
                Ok(mut feed) => {
                    backoff = Duration::from_secs(1);

                    if let Err(e) = self.snapshot().await {
                        warn!(error = %e, "post-connect snapshot failed, continuing with stale candles");
                    }
                    // Prints buffered while the snapshot ran predate it and
                    // carry no ordering guarantee.
                    while feed.try_recv().is_ok() {}

                    self.set_connected(true).await;
                    info!(instrument = %self.instrument, "market data live");

                    let mut resync = tokio::time::interval(self.snapshot_interval);
                    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    resync.tick().await;

                    loop {
                        tokio::select! {
                            maybe_trade = feed.recv() => match maybe_trade {
                                Some(trade) => self.apply_trade(trade).await,
                                None => break,
                            },
                            _ = resync.tick() => {
                                if let Err(e) = self.snapshot().await {
                                    warn!(error = %e, "periodic snapshot failed");
                                }
                            }
                        }
                    }

                    self.set_connected(false).await;
                }
                Err(e) => {
                    warn!(error = %e, "trade feed connect failed");
                }
            }

            warn!(
                instrument = %self.instrument,
                backoff_s = backoff.as_secs(),
                "trade stream down, reconnecting"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    async fn apply_trade(&self, trade: VenueTrade) {
        let mut state = self.state.write().await;
        state.latest_price = Some(trade.price);
        state.store.apply_trade(trade.price, trade.size, trade.at);
    }

    async fn set_connected(&self, connected: bool) {
        self.state.write().await.connected = connected;
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    /// One consistent copy of the market per call; callers never touch the
    /// lock themselves.
    pub async fn current_market_view(&self) -> MarketView {
        let state = self.state.read().await;
        MarketView {
            instrument: self.instrument.clone(),
            latest_price: state.latest_price,
            resistance_level: state.store.highest_high(self.resistance_periods),
            average_volume: state.store.average_volume(self.volume_lookback),
            current_volume: state
                .store
                .open_candle()
                .map(|c| c.volume)
                .unwrap_or(Decimal::ZERO),
            closed_candles: state.store.closed_len(),
            at: self.clock.now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::Candle;
    use crate::venue::MockVenue;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn base_time() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn config() -> BotConfig {
        BotConfig {
            resistance_periods: 3,
            volume_lookback: 3,
            candle_history: 10,
            snapshot_interval_s: 60,
            ..BotConfig::default()
        }
    }

    fn closed_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                instrument: Instrument::from("ETH-USD"),
                timeframe: Timeframe::M5,
                start_time: base_time() + chrono::Duration::minutes(5 * i as i64),
                open: dec!(100),
                high: dec!(100) + Decimal::from(i as u64),
                low: dec!(99),
                close: dec!(100),
                volume: dec!(1000),
            })
            .collect()
    }

    #[tokio::test]
    async fn view_is_not_ready_before_any_snapshot() {
        let venue = Arc::new(MockVenue::new());
        let clock = Arc::new(ManualClock::new(base_time()));
        let md = MarketData::new(&config(), venue, clock);

        let view = md.current_market_view().await;
        assert_eq!(view.latest_price, None);
        assert_eq!(view.resistance_level, None);
        assert_eq!(view.average_volume, Decimal::ZERO);
        assert_eq!(view.closed_candles, 0);
    }

    #[tokio::test]
    async fn snapshot_populates_the_view() {
        let venue = Arc::new(MockVenue::new());
        venue.set_candles(closed_candles(5));
        // Clock sits one hour past the last candle so all five are sealed.
        let clock = Arc::new(ManualClock::new(base_time() + chrono::Duration::hours(1)));
        let md = MarketData::new(&config(), venue, clock);

        md.snapshot().await.unwrap();
        let view = md.current_market_view().await;
        assert_eq!(view.closed_candles, 5);
        // Highest high over the last 3 of 5 candles.
        assert_eq!(view.resistance_level, Some(dec!(104)));
        assert_eq!(view.average_volume, dec!(1000));
        assert_eq!(view.latest_price, Some(dec!(100)));
    }

    #[tokio::test]
    async fn stream_trades_move_price_and_forming_candle() {
        let venue = Arc::new(MockVenue::new());
        venue.set_candles(closed_candles(5));
        let now = base_time() + chrono::Duration::hours(1);
        let clock = Arc::new(ManualClock::new(now));
        let md = Arc::new(MarketData::new(&config(), Arc::clone(&venue) as Arc<dyn VenueClient>, clock));

        md.snapshot().await.unwrap();
        let _task = Arc::clone(&md).spawn_stream();

        // Let the stream task subscribe and settle.
        tokio::time::sleep(Duration::from_millis(50)).await;
        venue.push_trade(dec!(105), dec!(40), now).await;
        venue
            .push_trade(dec!(104.5), dec!(10), now + chrono::Duration::seconds(5))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let view = md.current_market_view().await;
        assert_eq!(view.latest_price, Some(dec!(104.5)));
        assert_eq!(view.current_volume, dec!(50));
    }

    #[tokio::test]
    async fn disconnect_triggers_resnapshot_on_reconnect() {
        let venue = Arc::new(MockVenue::new());
        venue.set_candles(closed_candles(5));
        let clock = Arc::new(ManualClock::new(base_time() + chrono::Duration::hours(1)));
        let md = Arc::new(MarketData::new(&config(), Arc::clone(&venue) as Arc<dyn VenueClient>, clock));

        let _task = Arc::clone(&md).spawn_stream();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_connect = venue.candle_request_count();
        assert!(after_connect >= 1);
        assert!(md.is_connected().await);

        venue.disconnect_feed();
        // Backoff starts at one second; wait it out and confirm the stream
        // re-subscribed and pulled a fresh snapshot.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(venue.candle_request_count() > after_connect);
        assert!(md.is_connected().await);
    }

    #[tokio::test]
    async fn failed_snapshot_keeps_previous_view() {
        let venue = Arc::new(MockVenue::new());
        venue.set_candles(closed_candles(5));
        let clock = Arc::new(ManualClock::new(base_time() + chrono::Duration::hours(1)));
        let md = MarketData::new(&config(), Arc::clone(&venue) as Arc<dyn VenueClient>, clock);
        md.snapshot().await.unwrap();

        // A snapshot with shuffled timestamps must be rejected wholesale.
        let mut bad = closed_candles(5);
        bad.swap(1, 3);
        venue.set_candles(bad);
        assert!(matches!(
            md.snapshot().await,
            Err(MarketError::Snapshot(_))
        ));

        let view = md.current_market_view().await;
        assert_eq!(view.closed_candles, 5);
        assert_eq!(view.resistance_level, Some(dec!(104)));
    }
}
