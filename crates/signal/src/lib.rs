//! Scored-signal detectors.
//!
//! Each detector is fed snapshots by the orchestrator and keeps only its
//! own bounded rolling history. Detectors never see orchestrator state:
//! they return signals, the orchestrator applies effects.

pub mod breakout;
pub mod false_breakout;
pub mod stability;

use serde::{Deserialize, Serialize};

use market::types::Price;

/// Snapshot of technical indicators for one symbol, produced by the
/// indicator collaborator. Absent values mean "not enough history yet".
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub price: Price,
    pub rsi: f64,
    pub atr: f64,
    pub sma: f64,
    pub ema: f64,
    pub volume_sma: f64,
}

/// Rolling history buffer capped at a fixed number of samples.
#[derive(Debug, Clone, Default)]
pub(crate) struct RollingWindow {
    cap: usize,
    values: Vec<f64>,
}

impl RollingWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            values: Vec::with_capacity(cap + 1),
        }
    }

    pub fn push(&mut self, v: f64) {
        self.values.push(v);
        if self.values.len() > self.cap {
            self.values.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
