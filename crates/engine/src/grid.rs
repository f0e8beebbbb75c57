//! Market-suitability gate and range-based grid sizing.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use market::candle::Timeframe;
use market::types::{Money, Price, Qty};
use signal::breakout::GridBounds;

use crate::analyzer::{atr, rsi};
use crate::collab::{CandleSource, GridAnalysis, GridPlan};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSetupParams {
    pub timeframe: Timeframe,
    /// Candles required before any setup decision
    pub min_history_candles: usize,
    /// Candles the band is measured over
    pub range_window: usize,
    /// ATR above this fraction of price means the market is too wild (5%)
    pub max_atr_pct: f64,
    /// RSI outside [low, high] means a trend is running
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub rsi_period: usize,
    pub atr_period: usize,
    pub levels: u32,
    /// Fraction of the balance committed to the whole grid
    pub balance_fraction: f64,
}

impl Default for GridSetupParams {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::S1,
            min_history_candles: 50,
            range_window: 30,
            max_atr_pct: 0.05,
            rsi_low: 20.0,
            rsi_high: 80.0,
            rsi_period: 14,
            atr_period: 14,
            levels: 5,
            balance_fraction: 0.5,
        }
    }
}

pub struct RangeGridAnalysis {
    candles: Arc<dyn CandleSource>,
    params: GridSetupParams,
}

impl RangeGridAnalysis {
    pub fn new(candles: Arc<dyn CandleSource>, params: GridSetupParams) -> Self {
        Self { candles, params }
    }
}

impl GridAnalysis for RangeGridAnalysis {
    fn should_setup(&self) -> Result<(), String> {
        let p = &self.params;
        let window = self.candles.candles(p.timeframe, p.min_history_candles);
        if window.len() < p.min_history_candles {
            return Err(format!(
                "insufficient history: {} of {} candles",
                window.len(),
                p.min_history_candles
            ));
        }

        let closes: Vec<f64> = window.iter().map(|c| c.close.0).collect();
        let price = *closes.last().unwrap_or(&0.0);
        if price <= 0.0 {
            return Err("no valid last price".to_string());
        }

        if let Some(atr) = atr(&window, p.atr_period) {
            let atr_pct = atr / price;
            if atr_pct > p.max_atr_pct {
                return Err(format!(
                    "volatility too high: ATR {:.2}% of price",
                    atr_pct * 100.0
                ));
            }
        }

        if let Some(rsi) = rsi(&closes, p.rsi_period) {
            if rsi < p.rsi_low || rsi > p.rsi_high {
                return Err(format!("market trending: RSI {rsi:.1}"));
            }
        }

        Ok(())
    }

    fn analyze(&self, balance: Money) -> Result<GridPlan> {
        let p = &self.params;
        if let Err(reason) = self.should_setup() {
            bail!("grid setup rejected: {reason}");
        }

        let window = self.candles.candles(p.timeframe, p.range_window);
        let mut upper = f64::MIN;
        let mut lower = f64::MAX;
        for c in &window {
            upper = upper.max(c.high.0);
            lower = lower.min(c.low.0);
        }
        if upper <= lower {
            bail!("degenerate range: flat window");
        }

        let center = (upper + lower) / 2.0;
        let price = self
            .candles
            .latest_price()
            .context("no last price for grid sizing")?;

        let budget = balance.0 * p.balance_fraction;
        let qty_per_level = if p.levels == 0 || price.0 <= 0.0 {
            bail!("invalid grid sizing inputs");
        } else {
            Qty(budget / p.levels as f64 / price.0)
        };

        Ok(GridPlan {
            bounds: GridBounds {
                upper: Price(upper),
                lower: Price(lower),
                center: Price(center),
            },
            levels: p.levels,
            qty_per_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::CandleAggregator;
    use feed::MarketEvent;
    use market::candle::Candle;
    use market::types::TimestampMs;

    fn seeded(candles: Vec<Candle>) -> Arc<CandleAggregator> {
        let agg = Arc::new(CandleAggregator::new(vec![Timeframe::S1]));
        for c in candles {
            agg.apply(&MarketEvent::Candle {
                timeframe: Timeframe::S1,
                candle: c,
            });
        }
        agg
    }

    fn candle(i: i64, close: f64, spread: f64) -> Candle {
        Candle {
            ts: TimestampMs(i * 1_000),
            open: Price(close),
            high: Price(close + spread),
            low: Price(close - spread),
            close: Price(close),
            volume: Qty(1_000.0),
        }
    }

    fn ranging(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = if i % 2 == 0 { 99.5 } else { 100.5 };
                candle(i as i64, close, 0.5)
            })
            .collect()
    }

    #[test]
    fn refuses_with_insufficient_history() {
        let analysis = RangeGridAnalysis::new(seeded(ranging(10)), GridSetupParams::default());
        let reason = analysis.should_setup().unwrap_err();
        assert!(reason.contains("insufficient history"));
        assert!(analysis.analyze(Money(10_000.0)).is_err());
    }

    #[test]
    fn refuses_wild_volatility() {
        // 10-wide candles at price 100: ATR ~20% of price
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0, 10.0)).collect();
        let analysis = RangeGridAnalysis::new(seeded(candles), GridSetupParams::default());
        let reason = analysis.should_setup().unwrap_err();
        assert!(reason.contains("volatility"));
    }

    #[test]
    fn refuses_strong_trend() {
        let candles: Vec<Candle> = (0..60).map(|i| candle(i, 100.0 + i as f64, 0.2)).collect();
        let analysis = RangeGridAnalysis::new(seeded(candles), GridSetupParams::default());
        let reason = analysis.should_setup().unwrap_err();
        assert!(reason.contains("RSI"));
    }

    #[test]
    fn plans_bounds_from_recent_range() {
        let analysis = RangeGridAnalysis::new(seeded(ranging(60)), GridSetupParams::default());
        assert!(analysis.should_setup().is_ok());

        let plan = analysis.analyze(Money(10_000.0)).unwrap();
        assert_eq!(plan.bounds.upper, Price(101.0));
        assert_eq!(plan.bounds.lower, Price(99.0));
        assert_eq!(plan.bounds.center, Price(100.0));
        assert_eq!(plan.levels, 5);
        // 50% of 10k over 5 levels at ~100.5
        assert!(plan.qty_per_level.0 > 9.0 && plan.qty_per_level.0 < 11.0);
    }
}
