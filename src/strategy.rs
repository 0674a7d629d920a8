use rust_decimal::Decimal;
use tracing::debug;

use crate::config::BotConfig;
use crate::types::MarketView;

/// Proposed long entry with its exit levels already derived.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub size_usd: Decimal,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    NoSignal,
    EnterLong(EntryPlan),
}

/// Resistance breakout with volume confirmation.
///
/// Resistance is the highest high over the sealed-candle lookback, so a
/// breakout is a distinct crossing event rather than self-referential;
/// volume confirmation reads the forming candle because that is the earliest
/// moment it is knowable.
pub struct BreakoutStrategy {
    volume_factor: Decimal,
    risk_reward_ratio: Decimal,
    stop_offset_pct: Decimal,
    position_size_usd: Decimal,
}

impl BreakoutStrategy {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            volume_factor: config.volume_factor,
            risk_reward_ratio: config.risk_reward_ratio,
            stop_offset_pct: config.stop_offset_pct,
            position_size_usd: config.position_size_usd,
        }
    }

    pub fn evaluate(&self, view: &MarketView) -> Signal {
        let Some(price) = view.latest_price else {
            return Signal::NoSignal;
        };
        let Some(resistance) = view.resistance_level else {
            return Signal::NoSignal;
        };

        if view.average_volume <= Decimal::ZERO {
            return Signal::NoSignal;
        }
        // A touch of the level is not a breakout; the close must be beyond it.
        if price <= resistance {
            return Signal::NoSignal;
        }
        if view.current_volume < self.volume_factor * view.average_volume {
            return Signal::NoSignal;
        }

        let stop_loss = resistance * (Decimal::ONE - self.stop_offset_pct);
        if price <= stop_loss {
            debug!(
                %price,
                %stop_loss,
                "suppressing entry whose stop would sit at or above price"
            );
            return Signal::NoSignal;
        }

        let take_profit = price + self.risk_reward_ratio * (price - stop_loss);
        let volume_ratio = view.current_volume / view.average_volume;

        Signal::EnterLong(EntryPlan {
            entry_price: price,
            stop_loss,
            take_profit,
            size_usd: self.position_size_usd,
            reasoning: format!(
                "price {} broke resistance {} on {:.1}x average volume",
                price, resistance, volume_ratio
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Instrument;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn strategy() -> BreakoutStrategy {
        BreakoutStrategy::new(&BotConfig {
            volume_factor: dec!(2.5),
            risk_reward_ratio: dec!(3),
            stop_offset_pct: dec!(0.01),
            position_size_usd: dec!(100),
            ..BotConfig::default()
        })
    }

    fn view(price: Decimal, resistance: Decimal, current_volume: Decimal, avg: Decimal) -> MarketView {
        MarketView {
            instrument: Instrument::from("ETH-USD"),
            latest_price: Some(price),
            resistance_level: Some(resistance),
            average_volume: avg,
            current_volume,
            closed_candles: 24,
            at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn breakout_with_volume_enters_long() {
        // 24 closed candles with highs at 100, forming candle trading at 101
        // on 2600 volume against a 1000 average.
        let signal = strategy().evaluate(&view(dec!(101), dec!(100), dec!(2600), dec!(1000)));
        match signal {
            Signal::EnterLong(plan) => {
                assert_eq!(plan.entry_price, dec!(101));
                assert_eq!(plan.stop_loss, dec!(99));
                assert_eq!(plan.take_profit, dec!(107));
                assert_eq!(plan.size_usd, dec!(100));
            }
            Signal::NoSignal => panic!("expected an entry"),
        }
    }

    #[test]
    fn missing_volume_confirmation_stays_flat() {
        let signal = strategy().evaluate(&view(dec!(101), dec!(100), dec!(1500), dec!(1000)));
        assert_eq!(signal, Signal::NoSignal);
    }

    #[test]
    fn exact_touch_of_resistance_does_not_trigger() {
        let signal = strategy().evaluate(&view(dec!(100), dec!(100), dec!(9000), dec!(1000)));
        assert_eq!(signal, Signal::NoSignal);
    }

    #[test]
    fn zero_average_volume_suppresses_entry() {
        let signal = strategy().evaluate(&view(dec!(101), dec!(100), dec!(2600), dec!(0)));
        assert_eq!(signal, Signal::NoSignal);
    }

    #[test]
    fn not_ready_view_stays_flat() {
        let mut v = view(dec!(101), dec!(100), dec!(2600), dec!(1000));
        v.resistance_level = None;
        assert_eq!(strategy().evaluate(&v), Signal::NoSignal);

        let mut v = view(dec!(101), dec!(100), dec!(2600), dec!(1000));
        v.latest_price = None;
        assert_eq!(strategy().evaluate(&v), Signal::NoSignal);
    }

    #[test]
    fn extreme_stop_offset_still_yields_ordered_levels() {
        let wide = BreakoutStrategy::new(&BotConfig {
            volume_factor: dec!(1.5),
            stop_offset_pct: dec!(0.9),
            ..BotConfig::default()
        });
        match wide.evaluate(&view(dec!(10), dec!(9.99), dec!(5000), dec!(1000))) {
            Signal::EnterLong(plan) => {
                assert!(plan.stop_loss < plan.entry_price);
                assert!(plan.entry_price < plan.take_profit);
            }
            Signal::NoSignal => panic!("expected an entry"),
        }
    }

    #[test]
    fn entry_emitted_iff_all_three_conditions_hold() {
        let s = strategy();
        let prices = [dec!(99), dec!(100), dec!(100.5)];
        let volumes = [dec!(0), dec!(2499), dec!(2500), dec!(4000)];
        let averages = [dec!(0), dec!(1000)];

        for price in prices {
            for volume in volumes {
                for avg in averages {
                    let v = view(price, dec!(100), volume, avg);
                    let expected = price > dec!(100)
                        && avg > Decimal::ZERO
                        && volume >= dec!(2.5) * avg;
                    let got = matches!(s.evaluate(&v), Signal::EnterLong(_));
                    assert_eq!(
                        got, expected,
                        "price={} volume={} avg={}",
                        price, volume, avg
                    );
                }
            }
        }
    }

    #[test]
    fn exit_levels_honour_the_risk_reward_ratio() {
        for (rr, offset) in [
            (dec!(2), dec!(0.005)),
            (dec!(3), dec!(0.01)),
            (dec!(4.5), dec!(0.02)),
        ] {
            let s = BreakoutStrategy::new(&BotConfig {
                volume_factor: dec!(1.5),
                risk_reward_ratio: rr,
                stop_offset_pct: offset,
                ..BotConfig::default()
            });
            let price = dec!(205.5);
            let resistance = dec!(204);
            match s.evaluate(&view(price, resistance, dec!(4000), dec!(1000))) {
                Signal::EnterLong(plan) => {
                    assert!(plan.stop_loss < plan.entry_price);
                    assert!(plan.entry_price < plan.take_profit);
                    let risk = plan.entry_price - plan.stop_loss;
                    let reward = plan.take_profit - plan.entry_price;
                    assert_eq!(reward, rr * risk);
                }
                Signal::NoSignal => panic!("expected an entry for rr={}", rr),
            }
        }
    }
}
