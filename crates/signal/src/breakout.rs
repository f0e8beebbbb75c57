//! Grid-bound breakout detection.
//!
//! A breakout signal is produced when price leaves the grid band by more
//! than `range * min_breakout_strength`. Confidence blends beyond-bound
//! distance, volume, candle momentum and indicator agreement, with a
//! penalty that grows with consecutive false breakouts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use market::candle::Candle;
use market::types::Price;

use crate::{IndicatorSnapshot, RollingWindow};

/// Confidence weights (hand-tuned, kept as named constants)
const W_STRENGTH: f64 = 0.30;
const W_VOLUME: f64 = 0.25;
const W_MOMENTUM: f64 = 0.25;
const W_TECHNICAL: f64 = 0.20;

/// Per-failure confidence penalty and its cap
const FAILURE_PENALTY_STEP: f64 = 0.1;
const FAILURE_PENALTY_CAP: f64 = 0.5;

/// An episode is tracked (and a mode switch is worth requesting)
/// only above this confidence.
pub const OPEN_CONFIDENCE: f64 = 0.6;

/// Volume samples the detector keeps as its own fallback average
const VOLUME_HISTORY_LEN: usize = 20;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakoutDirection {
    Up,
    Down,
}

impl BreakoutDirection {
    pub fn opposite(self) -> Self {
        match self {
            BreakoutDirection::Up => BreakoutDirection::Down,
            BreakoutDirection::Down => BreakoutDirection::Up,
        }
    }
}

/// Active grid band
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridBounds {
    pub upper: Price,
    pub lower: Price,
    pub center: Price,
}

impl GridBounds {
    /// Band width in price units
    pub fn range(&self) -> f64 {
        self.upper.0 - self.lower.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutSignal {
    pub direction: BreakoutDirection,
    /// 0..1
    pub confidence: f64,
    /// Percent distance beyond the broken bound
    pub strength: f64,
    pub volume_ratio: f64,
    pub price: Price,
    pub at: DateTime<Utc>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakoutParams {
    /// Candles a tracked episode must survive before confirmation
    pub confirmation_candles: u32,
    pub candle_interval_ms: u64,
    /// Fraction of the grid range tolerated beyond a bound (0.3%)
    pub min_breakout_strength: f64,
    /// Volume ratio considered strong confirmation (1.5x average)
    pub volume_multiplier: f64,
    /// ATR as fraction of price that counts as a significant move (0.5%)
    pub momentum_threshold: f64,
}

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            confirmation_candles: 3,
            candle_interval_ms: 300,
            min_breakout_strength: 0.003,
            volume_multiplier: 1.5,
            momentum_threshold: 0.005,
        }
    }
}

impl BreakoutParams {
    pub fn confirmation_window(&self) -> Duration {
        Duration::milliseconds(self.confirmation_candles as i64 * self.candle_interval_ms as i64)
    }
}

/// One breakout from detection to confirmation or failure
#[derive(Debug, Clone)]
struct Episode {
    direction: BreakoutDirection,
    started: DateTime<Utc>,
    entry_price: Price,
    reverted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakoutStats {
    pub true_breakouts: u32,
    pub false_breakouts: u32,
    pub consecutive_failures: u32,
}

pub struct BreakoutDetector {
    params: BreakoutParams,
    recent_volumes: RollingWindow,
    episode: Option<Episode>,
    stats: BreakoutStats,
}

impl BreakoutDetector {
    pub fn new(params: BreakoutParams) -> Self {
        Self {
            params,
            recent_volumes: RollingWindow::new(VOLUME_HISTORY_LEN),
            episode: None,
            stats: BreakoutStats::default(),
        }
    }

    pub fn stats(&self) -> BreakoutStats {
        self.stats
    }

    pub fn tracking(&self) -> bool {
        self.episode.is_some()
    }

    /// Checks the current price against the grid band.
    ///
    /// Returns `None` while price stays inside `[lower - eps, upper + eps]`
    /// or while indicator/candle data is missing (insufficient data is not
    /// a fault). An episode is opened when confidence reaches
    /// [`OPEN_CONFIDENCE`] and none is already being tracked.
    pub fn detect(
        &mut self,
        bounds: GridBounds,
        price: Price,
        indicators: Option<&IndicatorSnapshot>,
        current_candle: Option<&Candle>,
        now: DateTime<Utc>,
    ) -> Option<BreakoutSignal> {
        if let Some(c) = current_candle {
            self.recent_volumes.push(c.volume.0);
        }

        let direction = self.band_breach(bounds, price)?;

        let ind = indicators?;
        let candle = current_candle?;

        let strength = breakout_strength(bounds, price, direction);
        let volume_ratio = self.volume_ratio(candle, ind);
        let momentum = candle.body_pct();
        let rsi_supports = rsi_supports(ind, direction);
        let atr_supports = self.atr_supports(ind, price);

        let confidence =
            self.confidence(strength, volume_ratio, momentum, rsi_supports, atr_supports);

        let reasons = self.reasons(
            direction,
            strength,
            volume_ratio,
            momentum,
            rsi_supports,
            atr_supports,
        );

        if confidence >= OPEN_CONFIDENCE && self.episode.is_none() {
            self.episode = Some(Episode {
                direction,
                started: now,
                entry_price: price,
                reverted: false,
            });
        }

        Some(BreakoutSignal {
            direction,
            confidence,
            strength,
            volume_ratio,
            price,
            at: now,
            reasons,
        })
    }

    /// Settles the tracked episode once the confirmation window has
    /// elapsed. Returns `None` while the window is still open or nothing
    /// is tracked; `Some(true)` for a confirmed breakout, `Some(false)`
    /// for a false one (which bumps the consecutive-failure counter).
    pub fn confirm(&mut self, price: Price, now: DateTime<Utc>) -> Option<bool> {
        let ep = self.episode.as_mut()?;

        let adverse = match ep.direction {
            BreakoutDirection::Up => price.0 <= ep.entry_price.0,
            BreakoutDirection::Down => price.0 >= ep.entry_price.0,
        };
        if adverse {
            ep.reverted = true;
        }

        if now - ep.started < self.params.confirmation_window() {
            return None;
        }

        let valid = !ep.reverted && !adverse;
        if valid {
            self.stats.true_breakouts += 1;
            self.stats.consecutive_failures = 0;
        } else {
            self.stats.false_breakouts += 1;
            self.stats.consecutive_failures += 1;
        }
        self.episode = None;
        Some(valid)
    }

    /// Abandons the tracked episode as false without waiting out the
    /// confirmation window. Used when an external check already settled
    /// the question.
    pub fn abort_episode(&mut self) {
        if self.episode.take().is_some() {
            self.stats.false_breakouts += 1;
            self.stats.consecutive_failures += 1;
        }
    }

    /// Direction of a band breach, if any. The threshold is inclusive:
    /// price exactly at `upper + eps` fires with strength ~ 0.
    fn band_breach(&self, bounds: GridBounds, price: Price) -> Option<BreakoutDirection> {
        let eps = bounds.range() * self.params.min_breakout_strength;
        if price.0 >= bounds.upper.0 + eps {
            Some(BreakoutDirection::Up)
        } else if price.0 <= bounds.lower.0 - eps {
            Some(BreakoutDirection::Down)
        } else {
            None
        }
    }

    /// Current candle volume against the indicator average, falling back
    /// to the detector's own rolling mean before the SMA has history.
    fn volume_ratio(&self, candle: &Candle, ind: &IndicatorSnapshot) -> f64 {
        let avg = if ind.volume_sma > 0.0 {
            ind.volume_sma
        } else {
            self.recent_volumes.mean()
        };
        if avg <= 0.0 {
            return 1.0;
        }
        candle.volume.0 / avg
    }

    fn atr_supports(&self, ind: &IndicatorSnapshot, price: Price) -> bool {
        if ind.atr <= 0.0 || price.0 <= 0.0 {
            return true; // no ATR data yet
        }
        ind.atr / price.0 >= self.params.momentum_threshold
    }

    fn confidence(
        &self,
        strength: f64,
        volume_ratio: f64,
        momentum: f64,
        rsi_supports: bool,
        atr_supports: bool,
    ) -> f64 {
        // 5% beyond the bound, 2x volume and a 1% body each saturate
        // their component.
        let strength_score = (strength / 5.0).min(1.0);
        let volume_score = (volume_ratio / 2.0).min(1.0);
        let momentum_score = (momentum.abs() / 0.01).min(1.0);

        let mut technical_score = 0.5;
        if rsi_supports {
            technical_score += 0.25;
        }
        if atr_supports {
            technical_score += 0.25;
        }

        let penalty = (self.stats.consecutive_failures as f64 * FAILURE_PENALTY_STEP)
            .min(FAILURE_PENALTY_CAP);

        let raw = strength_score * W_STRENGTH
            + volume_score * W_VOLUME
            + momentum_score * W_MOMENTUM
            + technical_score * W_TECHNICAL
            - penalty;

        raw.clamp(0.0, 1.0)
    }

    fn reasons(
        &self,
        direction: BreakoutDirection,
        strength: f64,
        volume_ratio: f64,
        momentum: f64,
        rsi_supports: bool,
        atr_supports: bool,
    ) -> Vec<String> {
        let mut reasons = Vec::new();

        reasons.push(match direction {
            BreakoutDirection::Up => "price broke above upper grid bound".to_string(),
            BreakoutDirection::Down => "price broke below lower grid bound".to_string(),
        });

        if strength > 0.5 {
            reasons.push("strong breakout".to_string());
        }
        if volume_ratio > self.params.volume_multiplier {
            reasons.push("high volume confirmation".to_string());
        } else if volume_ratio > 1.0 {
            reasons.push("moderate volume support".to_string());
        }
        if momentum.abs() > self.params.momentum_threshold {
            reasons.push("strong candle momentum".to_string());
        }
        if rsi_supports {
            reasons.push("RSI agrees with direction".to_string());
        }
        if atr_supports {
            reasons.push("ATR indicates a significant move".to_string());
        }
        if self.stats.consecutive_failures > 0 {
            reasons.push(format!(
                "{} recent false breakout(s)",
                self.stats.consecutive_failures
            ));
        }

        reasons
    }
}

/// Percent distance beyond the broken bound
fn breakout_strength(bounds: GridBounds, price: Price, direction: BreakoutDirection) -> f64 {
    match direction {
        BreakoutDirection::Up => (price.0 - bounds.upper.0) / bounds.upper.0 * 100.0,
        BreakoutDirection::Down => (bounds.lower.0 - price.0) / bounds.lower.0 * 100.0,
    }
}

fn rsi_supports(ind: &IndicatorSnapshot, direction: BreakoutDirection) -> bool {
    if ind.rsi == 0.0 {
        return true; // no RSI data yet
    }
    match direction {
        BreakoutDirection::Up => ind.rsi > 50.0,
        BreakoutDirection::Down => ind.rsi < 50.0,
    }
}
