//! False-breakout detection for an in-flight breakout episode.
//!
//! Four independent checks run against the episode history: quick price
//! reversal, volume collapse, momentum sign flip and post-breakout
//! consolidation. Any firing check produces a signal; agreement between
//! checks raises the combined confidence.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use market::types::Price;

use crate::breakout::BreakoutDirection;
use crate::{RollingWindow, mean, std_dev};

/// Bonus added per additional agreeing check
const AGREEMENT_BONUS: f64 = 0.1;

/// Price samples kept for momentum and consolidation checks
const PRICE_HISTORY_LEN: usize = 10;

/// Volume samples kept for the collapse check
const VOLUME_HISTORY_LEN: usize = 20;

/// Minimum volume history before the collapse check is meaningful
const MIN_VOLUME_SAMPLES: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReversalKind {
    /// Flat the breakout position at a loss
    StopLoss,
    /// The fakeout still left room to exit in profit
    TakeProfit,
    /// Reversal is strong enough to flip into the opposite direction
    Reverse,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FalseBreakoutParams {
    /// Adverse move that qualifies as a fakeout (0.5%)
    pub fakeout_threshold: f64,
    /// Adverse move that justifies flipping the position (1%)
    pub reversal_threshold: f64,
    /// Momentum samples needed before the sign-flip check runs
    pub momentum_samples: usize,
    /// Volume drop ratio that counts as a collapse (50%)
    pub min_volume_decline: f64,
    /// Episode age before momentum evidence is trusted
    pub min_confirmation_ms: u64,
    /// Coefficient of variation below which price is consolidating
    pub consolidation_threshold: f64,
}

impl Default for FalseBreakoutParams {
    fn default() -> Self {
        Self {
            fakeout_threshold: 0.005,
            reversal_threshold: 0.01,
            momentum_samples: 3,
            min_volume_decline: 0.5,
            min_confirmation_ms: 900,
            consolidation_threshold: 0.002,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FalseBreakoutSignal {
    /// 0..1
    pub confidence: f64,
    pub reversal: ReversalKind,
    /// Adverse change relative to the episode entry, as a fraction
    pub adverse_change: f64,
    pub reasons: Vec<String>,
}

/// One sub-check's verdict
struct Evidence {
    confidence: f64,
    reason: String,
}

pub struct FalseBreakoutDetector {
    params: FalseBreakoutParams,
    prices: RollingWindow,
    volumes: RollingWindow,
}

impl FalseBreakoutDetector {
    pub fn new(params: FalseBreakoutParams) -> Self {
        Self {
            params,
            prices: RollingWindow::new(PRICE_HISTORY_LEN),
            volumes: RollingWindow::new(VOLUME_HISTORY_LEN),
        }
    }

    /// Clears episode history. Call when a breakout episode ends.
    pub fn reset(&mut self) {
        self.prices = RollingWindow::new(PRICE_HISTORY_LEN);
        self.volumes = RollingWindow::new(VOLUME_HISTORY_LEN);
    }

    /// Evaluates the current sample against the episode entry.
    ///
    /// `atr` and `volume` may be zero when the corresponding indicator
    /// has no history yet; the affected checks then stay silent.
    pub fn detect(
        &mut self,
        entry_price: Price,
        price: Price,
        direction: BreakoutDirection,
        atr: f64,
        volume: f64,
        elapsed: Duration,
    ) -> Option<FalseBreakoutSignal> {
        self.prices.push(price.0);
        if volume > 0.0 {
            self.volumes.push(volume);
        }

        if entry_price.0 <= 0.0 {
            return None;
        }
        let adverse = adverse_change(entry_price, price, direction);

        let mut evidence = Vec::new();
        if let Some(e) = self.quick_reversal(entry_price, adverse, atr) {
            evidence.push(e);
        }
        if let Some(e) = self.volume_collapse(volume) {
            evidence.push(e);
        }
        if let Some(e) = self.momentum_flip(direction, elapsed) {
            evidence.push(e);
        }
        if let Some(e) = self.consolidation(elapsed) {
            evidence.push(e);
        }

        if evidence.is_empty() {
            return None;
        }

        let base = evidence
            .iter()
            .map(|e| e.confidence)
            .fold(0.0_f64, f64::max);
        let confidence =
            (base + AGREEMENT_BONUS * (evidence.len() as f64 - 1.0)).min(1.0);
        let reasons = evidence.into_iter().map(|e| e.reason).collect();

        Some(FalseBreakoutSignal {
            confidence,
            reversal: self.classify(adverse),
            adverse_change: adverse,
            reasons,
        })
    }

    /// Price snapped back through the fakeout band shortly after entry.
    fn quick_reversal(&self, entry: Price, adverse: f64, atr: f64) -> Option<Evidence> {
        if adverse <= self.params.fakeout_threshold || adverse >= self.params.reversal_threshold {
            return None;
        }

        let atr_change = atr / entry.0;
        // moves inside half an ATR are noise
        if atr_change > 0.0 && adverse < atr_change * 0.5 {
            return None;
        }

        let magnitude_conf = (adverse * 100.0).min(1.0);
        let confidence = if atr_change > 0.0 {
            let atr_conf = (adverse / atr_change * 2.0).min(1.0);
            (magnitude_conf + atr_conf) / 2.0
        } else {
            magnitude_conf
        };

        Some(Evidence {
            confidence,
            reason: format!("quick reversal of {:.2}% against the breakout", adverse * 100.0),
        })
    }

    /// Breakout volume dried up relative to its own episode average.
    fn volume_collapse(&self, volume: f64) -> Option<Evidence> {
        if volume <= 0.0 || self.volumes.len() < MIN_VOLUME_SAMPLES {
            return None;
        }
        let avg = self.volumes.mean();
        if avg <= 0.0 {
            return None;
        }

        let drop_ratio = 1.0 - volume / avg;
        if drop_ratio < self.params.min_volume_decline {
            return None;
        }

        Some(Evidence {
            confidence: (drop_ratio * 2.0).min(1.0),
            reason: format!("volume collapsed {:.0}% below episode average", drop_ratio * 100.0),
        })
    }

    /// Average rate of change turned against the breakout direction.
    fn momentum_flip(&self, direction: BreakoutDirection, elapsed: Duration) -> Option<Evidence> {
        if elapsed < Duration::milliseconds(self.params.min_confirmation_ms as i64) {
            return None;
        }

        let prices = self.prices.values();
        if prices.len() < self.params.momentum_samples + 1 {
            return None;
        }

        let rates: Vec<f64> = prices
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if rates.len() < self.params.momentum_samples {
            return None;
        }

        let avg_rate = mean(&rates[rates.len() - self.params.momentum_samples..]);
        let flipped = match direction {
            BreakoutDirection::Up => avg_rate < 0.0,
            BreakoutDirection::Down => avg_rate > 0.0,
        };
        if !flipped {
            return None;
        }

        Some(Evidence {
            confidence: (avg_rate.abs() * 100.0).min(1.0),
            reason: "momentum flipped against the breakout".to_string(),
        })
    }

    /// Price stopped moving: coefficient of variation below threshold.
    /// Only trusted once the episode is old enough to have had a chance
    /// to continue.
    fn consolidation(&self, elapsed: Duration) -> Option<Evidence> {
        if elapsed < Duration::milliseconds(self.params.min_confirmation_ms as i64) {
            return None;
        }
        let prices = self.prices.values();
        if prices.len() < self.params.momentum_samples + 1 {
            return None;
        }

        let m = mean(prices);
        if m <= 0.0 {
            return None;
        }
        let cv = std_dev(prices) / m;
        if cv >= self.params.consolidation_threshold {
            return None;
        }

        let confidence = if cv <= 0.0 {
            1.0
        } else {
            (self.params.consolidation_threshold / cv * 0.5).min(1.0)
        };
        Some(Evidence {
            confidence,
            reason: "price consolidating instead of continuing".to_string(),
        })
    }

    /// Picks the recovery action from the size of the adverse move.
    fn classify(&self, adverse: f64) -> ReversalKind {
        if adverse > self.params.reversal_threshold {
            ReversalKind::Reverse
        } else if adverse > self.params.fakeout_threshold * 1.5 {
            ReversalKind::TakeProfit
        } else {
            ReversalKind::StopLoss
        }
    }
}

/// Signed adverse change: positive when price moved against the breakout.
fn adverse_change(entry: Price, price: Price, direction: BreakoutDirection) -> f64 {
    let change = (price.0 - entry.0) / entry.0;
    match direction {
        BreakoutDirection::Up => -change,
        BreakoutDirection::Down => change,
    }
}
