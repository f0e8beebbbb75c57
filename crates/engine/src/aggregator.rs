//! Tick to multi-timeframe candle rollup.
//!
//! One aggregator instance per symbol. Ticks are bucketed by timestamp
//! into every configured timeframe at once; externally supplied candles
//! (e.g. from replay) are appended to their timeframe directly.

use std::collections::HashMap;
use std::sync::Mutex;

use market::candle::{Candle, Tick, Timeframe};
use market::types::{Price, Qty, TimestampMs};

use feed::MarketEvent;

use crate::collab::CandleSource;

/// Completed candles kept per timeframe
const RETENTION: usize = 500;

#[derive(Debug, Default)]
struct Series {
    completed: Vec<Candle>,
    building: Option<Candle>,
}

impl Series {
    fn apply_tick(&mut self, tick: &Tick, frame_ms: i64) {
        let bucket = tick.ts.0 - tick.ts.0.rem_euclid(frame_ms);

        match &mut self.building {
            Some(c) if c.ts.0 == bucket => {
                c.high = Price(c.high.0.max(tick.price.0));
                c.low = Price(c.low.0.min(tick.price.0));
                c.close = tick.price;
                c.volume = Qty(c.volume.0 + tick.volume.0);
            }
            _ => {
                if let Some(done) = self.building.take() {
                    self.push_completed(done);
                }
                self.building = Some(Candle {
                    ts: TimestampMs(bucket),
                    open: tick.price,
                    high: tick.price,
                    low: tick.price,
                    close: tick.price,
                    volume: tick.volume,
                });
            }
        }
    }

    fn push_completed(&mut self, c: Candle) {
        self.completed.push(c);
        if self.completed.len() > RETENTION {
            let excess = self.completed.len() - RETENTION;
            self.completed.drain(0..excess);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    series: HashMap<Timeframe, Series>,
    last_price: Option<Price>,
}

pub struct CandleAggregator {
    timeframes: Vec<Timeframe>,
    inner: Mutex<Inner>,
}

impl CandleAggregator {
    pub fn new(timeframes: Vec<Timeframe>) -> Self {
        Self {
            timeframes,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn apply(&self, event: &MarketEvent) {
        let mut inner = self.lock();
        match event {
            MarketEvent::Tick(tick) => {
                inner.last_price = Some(tick.price);
                for tf in &self.timeframes {
                    inner
                        .series
                        .entry(*tf)
                        .or_default()
                        .apply_tick(tick, tf.millis());
                }
            }
            MarketEvent::Candle { timeframe, candle } => {
                inner.last_price = Some(candle.close);
                inner
                    .series
                    .entry(*timeframe)
                    .or_default()
                    .push_completed(*candle);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl CandleSource for CandleAggregator {
    fn candles(&self, timeframe: Timeframe, count: usize) -> Vec<Candle> {
        let inner = self.lock();
        let Some(series) = inner.series.get(&timeframe) else {
            return Vec::new();
        };
        let start = series.completed.len().saturating_sub(count);
        series.completed[start..].to_vec()
    }

    fn current_candle(&self, timeframe: Timeframe) -> Option<Candle> {
        let inner = self.lock();
        let series = inner.series.get(&timeframe)?;
        series.building.or_else(|| series.completed.last().copied())
    }

    fn latest_price(&self) -> Option<Price> {
        self.lock().last_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts: i64, price: f64, volume: f64) -> MarketEvent {
        MarketEvent::Tick(Tick {
            ts: TimestampMs(ts),
            price: Price(price),
            volume: Qty(volume),
        })
    }

    fn aggregator() -> CandleAggregator {
        CandleAggregator::new(vec![Timeframe::S1, Timeframe::S3])
    }

    #[test]
    fn ticks_roll_into_bucketed_candles() {
        let agg = aggregator();
        agg.apply(&tick(0, 100.0, 10.0));
        agg.apply(&tick(400, 101.0, 5.0));
        agg.apply(&tick(900, 99.5, 5.0));
        // next second: first candle completes
        agg.apply(&tick(1_100, 100.2, 1.0));

        let done = agg.candles(Timeframe::S1, 10);
        assert_eq!(done.len(), 1);
        let c = done[0];
        assert_eq!(c.ts, TimestampMs(0));
        assert_eq!(c.open, Price(100.0));
        assert_eq!(c.high, Price(101.0));
        assert_eq!(c.low, Price(99.5));
        assert_eq!(c.close, Price(99.5));
        assert_eq!(c.volume, Qty(20.0));

        // the 3s bucket is still building
        assert!(agg.candles(Timeframe::S3, 10).is_empty());
        let building = agg.current_candle(Timeframe::S3).unwrap();
        assert_eq!(building.volume, Qty(21.0));
    }

    #[test]
    fn latest_price_follows_both_event_kinds() {
        let agg = aggregator();
        assert!(agg.latest_price().is_none());
        agg.apply(&tick(0, 100.0, 1.0));
        assert_eq!(agg.latest_price(), Some(Price(100.0)));

        agg.apply(&MarketEvent::Candle {
            timeframe: Timeframe::S1,
            candle: Candle {
                ts: TimestampMs(1_000),
                open: Price(100.0),
                high: Price(102.0),
                low: Price(100.0),
                close: Price(101.5),
                volume: Qty(3.0),
            },
        });
        assert_eq!(agg.latest_price(), Some(Price(101.5)));
        assert_eq!(agg.candles(Timeframe::S1, 10).len(), 1);
    }

    #[test]
    fn window_queries_return_most_recent_last() {
        let agg = aggregator();
        for i in 0..10 {
            agg.apply(&tick(i * 1_000, 100.0 + i as f64, 1.0));
        }
        let last3 = agg.candles(Timeframe::S1, 3);
        assert_eq!(last3.len(), 3);
        assert!(last3[0].ts.0 < last3[2].ts.0);
        assert_eq!(last3[2].close, Price(108.0));
    }
}
