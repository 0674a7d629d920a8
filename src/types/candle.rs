use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Instrument, Timeframe};

/// One OHLCV bar. The bar covers `[start_time, start_time + timeframe)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub start_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + self.timeframe.duration()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_time && at < self.end_time()
    }

    fn from_trade(
        instrument: Instrument,
        timeframe: Timeframe,
        price: Decimal,
        size: Decimal,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument,
            timeframe,
            start_time: timeframe.bucket_start(at),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
        }
    }

    fn absorb_trade(&mut self, price: Decimal, size: Decimal) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += size;
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot candle for {got} does not belong to {expected}")]
    MixedInstruments { expected: Instrument, got: Instrument },
    #[error("snapshot timeframe {got} differs from store timeframe {expected}")]
    MixedTimeframes { expected: Timeframe, got: Timeframe },
    #[error("snapshot timestamps are not strictly increasing at index {index}")]
    NonMonotonic { index: usize },
}

/// Bounded, time-ordered candle history for one (instrument, timeframe).
///
/// Sealed bars live in `closed`; the bar currently forming lives in `open`
/// and stays mutable until a trade past its end rolls it over. `tail` only
/// ever exposes sealed bars.
#[derive(Debug, Clone)]
pub struct CandleStore {
    instrument: Instrument,
    timeframe: Timeframe,
    max_size: usize,
    closed: Vec<Candle>,
    open: Option<Candle>,
}

impl CandleStore {
    pub fn new(instrument: Instrument, timeframe: Timeframe, max_size: usize) -> Self {
        Self {
            instrument,
            timeframe,
            max_size,
            closed: Vec::with_capacity(max_size),
            open: None,
        }
    }

    /// Atomically replace the entire store from a venue snapshot.
    ///
    /// Candles must be sorted ascending by `start_time`. A candle whose bar
    /// still contains `now` becomes the open candle; everything earlier is
    /// sealed. On any validation failure the store keeps its previous
    /// contents untouched.
    pub fn load_snapshot(
        &mut self,
        candles: Vec<Candle>,
        now: DateTime<Utc>,
    ) -> Result<(), SnapshotError> {
        for (index, candle) in candles.iter().enumerate() {
            if candle.instrument != self.instrument {
                return Err(SnapshotError::MixedInstruments {
                    expected: self.instrument.clone(),
                    got: candle.instrument.clone(),
                });
            }
            if candle.timeframe != self.timeframe {
                return Err(SnapshotError::MixedTimeframes {
                    expected: self.timeframe,
                    got: candle.timeframe,
                });
            }
            if index > 0 && candle.start_time <= candles[index - 1].start_time {
                return Err(SnapshotError::NonMonotonic { index });
            }
        }

        let mut closed = candles;
        let open = match closed.last() {
            Some(last) if last.end_time() > now => closed.pop(),
            _ => None,
        };

        if closed.len() > self.max_size {
            closed.drain(..closed.len() - self.max_size);
        }

        self.closed = closed;
        self.open = open;
        Ok(())
    }

    /// Fold one venue trade into the forming bar, sealing it when the trade
    /// falls past the bar's end. Out-of-order trades are dropped.
    pub fn apply_trade(&mut self, price: Decimal, size: Decimal, at: DateTime<Utc>) {
        if let Some(open) = &mut self.open {
            if open.contains(at) {
                open.absorb_trade(price, size);
                return;
            }
            if at < open.start_time {
                debug!(
                    instrument = %self.instrument,
                    trade_at = %at,
                    bar_start = %open.start_time,
                    "dropping out-of-order trade"
                );
                return;
            }
            let sealed = self.open.take().expect("open candle checked above");
            self.push_closed(sealed);
        }
        self.open = Some(Candle::from_trade(
            self.instrument.clone(),
            self.timeframe,
            price,
            size,
            at,
        ));
    }

    fn push_closed(&mut self, candle: Candle) {
        if self.closed.len() >= self.max_size {
            self.closed.remove(0);
        }
        self.closed.push(candle);
    }

    /// The last `k` sealed candles (all of them if fewer exist).
    pub fn tail(&self, k: usize) -> &[Candle] {
        let len = self.closed.len();
        if k >= len {
            &self.closed[..]
        } else {
            &self.closed[len - k..]
        }
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    /// Highest high over the last `k` sealed candles.
    pub fn highest_high(&self, k: usize) -> Option<Decimal> {
        self.tail(k).iter().map(|c| c.high).max()
    }

    /// Arithmetic mean volume over the last `k` sealed candles.
    pub fn average_volume(&self, k: usize) -> Decimal {
        let window = self.tail(k);
        if window.is_empty() {
            return Decimal::ZERO;
        }
        let total: Decimal = window.iter().map(|c| c.volume).sum();
        total / Decimal::from(window.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn eth() -> Instrument {
        Instrument::from("ETH-USD")
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn candle(offset_bars: i64, high: Decimal, volume: Decimal) -> Candle {
        let tf = Timeframe::M5;
        let start = t0() + tf.duration() * offset_bars as i32;
        Candle {
            instrument: eth(),
            timeframe: tf,
            start_time: start,
            open: dec!(100),
            high,
            low: dec!(99),
            close: dec!(100),
            volume,
        }
    }

    /// Tiny deterministic generator for invariant tests.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn snapshot_splits_open_candle_from_closed() {
        let mut store = CandleStore::new(eth(), Timeframe::M5, 100);
        let now = t0() + chrono::Duration::minutes(16); // inside bar 3
        let candles = vec![
            candle(0, dec!(101), dec!(10)),
            candle(1, dec!(102), dec!(11)),
            candle(2, dec!(103), dec!(12)),
            candle(3, dec!(104), dec!(1)),
        ];
        store.load_snapshot(candles, now).unwrap();

        assert_eq!(store.closed_len(), 3);
        assert_eq!(store.open_candle().unwrap().high, dec!(104));
        assert_eq!(store.highest_high(10), Some(dec!(103)));
    }

    #[test]
    fn snapshot_rejects_non_monotonic_timestamps() {
        let mut store = CandleStore::new(eth(), Timeframe::M5, 100);
        store
            .load_snapshot(vec![candle(0, dec!(101), dec!(10))], t0() + chrono::Duration::hours(1))
            .unwrap();

        let bad = vec![candle(2, dec!(101), dec!(10)), candle(1, dec!(102), dec!(11))];
        let err = store
            .load_snapshot(bad, t0() + chrono::Duration::hours(1))
            .unwrap_err();
        assert_eq!(err, SnapshotError::NonMonotonic { index: 1 });
        // The previous contents survive a rejected snapshot.
        assert_eq!(store.closed_len(), 1);
    }

    #[test]
    fn snapshot_rejects_foreign_timeframe() {
        let mut store = CandleStore::new(eth(), Timeframe::M5, 100);
        let mut wrong = candle(0, dec!(101), dec!(10));
        wrong.timeframe = Timeframe::M15;
        assert!(matches!(
            store.load_snapshot(vec![wrong], t0()),
            Err(SnapshotError::MixedTimeframes { .. })
        ));
    }

    #[test]
    fn trades_extend_then_seal_the_open_candle() {
        let mut store = CandleStore::new(eth(), Timeframe::M5, 100);

        store.apply_trade(dec!(100), dec!(1), t0());
        store.apply_trade(dec!(105), dec!(2), t0() + chrono::Duration::seconds(30));
        store.apply_trade(dec!(98), dec!(1), t0() + chrono::Duration::seconds(90));

        let open = store.open_candle().unwrap();
        assert_eq!(open.high, dec!(105));
        assert_eq!(open.low, dec!(98));
        assert_eq!(open.close, dec!(98));
        assert_eq!(open.volume, dec!(4));
        assert_eq!(store.closed_len(), 0);

        // A trade in the next bar seals the previous one.
        store.apply_trade(dec!(99), dec!(1), t0() + chrono::Duration::minutes(5));
        assert_eq!(store.closed_len(), 1);
        assert_eq!(store.tail(1)[0].close, dec!(98));
        assert_eq!(store.open_candle().unwrap().open, dec!(99));
    }

    #[test]
    fn out_of_order_trade_is_dropped() {
        let mut store = CandleStore::new(eth(), Timeframe::M5, 100);
        store.apply_trade(dec!(100), dec!(1), t0() + chrono::Duration::minutes(5));
        let before = store.open_candle().unwrap().clone();

        store.apply_trade(dec!(50), dec!(9), t0());
        assert_eq!(store.open_candle().unwrap(), &before);
        assert_eq!(store.closed_len(), 0);
    }

    #[test]
    fn tail_is_strictly_time_ordered_under_generated_trades() {
        let mut store = CandleStore::new(eth(), Timeframe::M1, 50);
        let mut rng = Lcg(42);

        let mut at = t0();
        for _ in 0..2_000 {
            // Mostly forward steps, occasionally a backwards (droppable) one.
            let step = rng.next() % 40;
            if step == 0 {
                at -= chrono::Duration::seconds(90);
            } else {
                at += chrono::Duration::seconds(step as i64);
            }
            let price = Decimal::from(90 + (rng.next() % 20) as u64);
            store.apply_trade(price, dec!(1), at);

            let tail = store.tail(50);
            for pair in tail.windows(2) {
                assert!(pair[0].start_time < pair[1].start_time);
            }
            if let Some(open) = store.open_candle() {
                if let Some(last) = tail.last() {
                    assert!(last.start_time < open.start_time);
                }
            }
            assert!(store.closed_len() <= 50);
        }
    }

    #[test]
    fn average_volume_over_window() {
        let mut store = CandleStore::new(eth(), Timeframe::M5, 100);
        let candles = vec![
            candle(0, dec!(101), dec!(10)),
            candle(1, dec!(102), dec!(20)),
            candle(2, dec!(103), dec!(30)),
        ];
        store
            .load_snapshot(candles, t0() + chrono::Duration::hours(1))
            .unwrap();

        assert_eq!(store.average_volume(2), dec!(25));
        assert_eq!(store.average_volume(10), dec!(20));
        assert_eq!(
            CandleStore::new(eth(), Timeframe::M5, 10).average_volume(5),
            Decimal::ZERO
        );
    }
}
