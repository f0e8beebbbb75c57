//! Indicator snapshots computed over aggregated candles.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use market::candle::{Candle, Timeframe};
use signal::IndicatorSnapshot;

use crate::collab::{CandleSource, IndicatorSource};

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorParams {
    pub rsi_period: usize,
    pub atr_period: usize,
    pub ma_period: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            atr_period: 14,
            ma_period: 20,
        }
    }
}

pub struct IndicatorEngine {
    candles: Arc<dyn CandleSource>,
    timeframe: Timeframe,
    params: IndicatorParams,
}

impl IndicatorEngine {
    pub fn new(candles: Arc<dyn CandleSource>, timeframe: Timeframe, params: IndicatorParams) -> Self {
        Self {
            candles,
            timeframe,
            params,
        }
    }
}

impl IndicatorSource for IndicatorEngine {
    fn snapshot(&self) -> Option<IndicatorSnapshot> {
        let need = self
            .params
            .rsi_period
            .max(self.params.atr_period)
            .max(self.params.ma_period)
            + 1;
        let window = self.candles.candles(self.timeframe, need);
        if window.len() < need {
            return None;
        }

        let closes: Vec<f64> = window.iter().map(|c| c.close.0).collect();
        Some(IndicatorSnapshot {
            price: window.last()?.close,
            rsi: rsi(&closes, self.params.rsi_period)?,
            atr: atr(&window, self.params.atr_period)?,
            sma: sma(&closes, self.params.ma_period)?,
            ema: ema(&closes, self.params.ma_period)?,
            volume_sma: volume_sma(&window, self.params.ma_period)?,
        })
    }
}

/// Simple-average RSI over the last `period` close-to-close changes.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let changes: Vec<f64> = closes[closes.len() - period - 1..]
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();

    let gains: f64 = changes.iter().filter(|c| **c > 0.0).sum();
    let losses: f64 = -changes.iter().filter(|c| **c < 0.0).sum::<f64>();
    if losses == 0.0 {
        return Some(if gains == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = gains / losses;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Mean true range over the last `period` candles.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let window = &candles[candles.len() - period - 1..];
    let sum: f64 = window
        .windows(2)
        .map(|w| {
            let (prev, cur) = (w[0], w[1]);
            let hl = cur.high.0 - cur.low.0;
            let hc = (cur.high.0 - prev.close.0).abs();
            let lc = (cur.low.0 - prev.close.0).abs();
            hl.max(hc).max(lc)
        })
        .sum();
    Some(sum / period as f64)
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let window = &values[values.len() - period..];
    let mut acc = window[0];
    for v in &window[1..] {
        acc = v * alpha + acc * (1.0 - alpha);
    }
    Some(acc)
}

pub fn volume_sma(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let sum: f64 = candles[candles.len() - period..]
        .iter()
        .map(|c| c.volume.0)
        .sum();
    Some(sum / period as f64)
}
