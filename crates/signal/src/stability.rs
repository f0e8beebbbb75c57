//! Post-breakout stability analysis.
//!
//! Scores how settled price action is after a confirmed breakout, over a
//! primary and a shorter secondary candle window. A run of stable reads
//! is what eventually sends the bot back to grid trading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use market::candle::Candle;

use crate::{mean, std_dev};

/// Component weights
const W_VOLATILITY: f64 = 0.30;
const W_MOMENTUM: f64 = 0.25;
const W_RANGE_CONTRACTION: f64 = 0.20;
const W_CONFORMITY: f64 = 0.15;
const W_TREND_CONSISTENCY: f64 = 0.10;

/// Target coefficient of variation for full conformity credit (1%)
const CONFORMITY_TARGET_CV: f64 = 0.01;

/// Bars in the short momentum leg
const SHORT_MOMENTUM_SPAN: usize = 3;

/// Trend slopes below this are flat (0.1%)
const TREND_THRESHOLD: f64 = 0.001;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StabilityAction {
    /// Stability held long enough, re-establish the grid
    ReturnToGrid,
    /// Stable read, keep watching for the required streak
    Monitor,
    /// Not stable, stay in breakout handling
    MaintainBreakout,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityParams {
    /// Primary candle window
    pub window: usize,
    /// Average absolute return that zeroes the volatility score (0.5%)
    pub volatility_threshold: f64,
    /// Average absolute momentum that zeroes the momentum score (0.2%)
    pub momentum_threshold: f64,
    /// Second-half over first-half range ratio that earns full
    /// contraction credit
    pub range_contraction_target: f64,
    /// Weighted score at or above which the market reads stable
    pub stability_threshold: f64,
    /// Stable reads in a row before returning to grid
    pub required_consecutive: u32,
}

impl Default for StabilityParams {
    fn default() -> Self {
        Self {
            window: 10,
            volatility_threshold: 0.005,
            momentum_threshold: 0.002,
            range_contraction_target: 0.7,
            stability_threshold: 0.70,
            required_consecutive: 3,
        }
    }
}

/// Running totals over scored stability checks
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityStats {
    pub total_checks: u32,
    pub stable_checks: u32,
}

impl StabilityStats {
    /// Fraction of checks that read stable, 0 before any check ran
    pub fn stability_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.stable_checks as f64 / self.total_checks as f64
    }
}

/// Per-component scores, each already in 0..1
#[derive(Debug, Copy, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub volatility: f64,
    pub momentum: f64,
    pub range_contraction: f64,
    pub conformity: f64,
    pub trend_consistency: f64,
}

impl ScoreComponents {
    pub fn weighted(&self) -> f64 {
        self.volatility * W_VOLATILITY
            + self.momentum * W_MOMENTUM
            + self.range_contraction * W_RANGE_CONTRACTION
            + self.conformity * W_CONFORMITY
            + self.trend_consistency * W_TREND_CONSISTENCY
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilitySignal {
    pub is_stable: bool,
    /// Weighted component score, 0..1
    pub score: f64,
    /// 0 when there was not enough history to judge
    pub confidence: f64,
    pub risk: RiskLevel,
    pub action: StabilityAction,
    pub components: ScoreComponents,
    pub consecutive_stable: u32,
    pub at: DateTime<Utc>,
}

pub struct StabilityDetector {
    params: StabilityParams,
    consecutive_stable: u32,
    stats: StabilityStats,
}

impl StabilityDetector {
    pub fn new(params: StabilityParams) -> Self {
        Self {
            params,
            consecutive_stable: 0,
            stats: StabilityStats::default(),
        }
    }

    pub fn stats(&self) -> StabilityStats {
        self.stats
    }

    /// Clears the stable streak. Call when a new breakout episode starts.
    /// Check totals survive across episodes.
    pub fn reset(&mut self) {
        self.consecutive_stable = 0;
    }

    /// Scores the two candle windows. Fewer than half the primary window
    /// yields a zero-confidence, unknown-risk read rather than an error.
    pub fn analyze(
        &mut self,
        primary: &[Candle],
        secondary: &[Candle],
        now: DateTime<Utc>,
    ) -> StabilitySignal {
        if primary.len() < self.params.window / 2 {
            self.consecutive_stable = 0;
            return StabilitySignal {
                is_stable: false,
                score: 0.0,
                confidence: 0.0,
                risk: RiskLevel::Unknown,
                action: StabilityAction::MaintainBreakout,
                components: ScoreComponents::default(),
                consecutive_stable: 0,
                at: now,
            };
        }

        let closes: Vec<f64> = primary.iter().map(|c| c.close.0).collect();
        let components = ScoreComponents {
            volatility: self.volatility_score(&closes),
            momentum: self.momentum_score(&closes),
            range_contraction: self.range_contraction_score(primary),
            conformity: conformity_score(&closes),
            trend_consistency: trend_consistency_score(primary, secondary),
        };
        let score = components.weighted();
        let is_stable = score >= self.params.stability_threshold;

        self.stats.total_checks += 1;
        if is_stable {
            self.stats.stable_checks += 1;
        }

        if is_stable {
            self.consecutive_stable += 1;
        } else {
            self.consecutive_stable = 0;
        }

        let action = if self.consecutive_stable >= self.params.required_consecutive {
            StabilityAction::ReturnToGrid
        } else if is_stable {
            StabilityAction::Monitor
        } else {
            StabilityAction::MaintainBreakout
        };

        let risk = if is_stable {
            RiskLevel::Low
        } else if components.volatility < 0.3 || components.momentum < 0.3 {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };

        StabilitySignal {
            is_stable,
            score,
            confidence: score,
            risk,
            action,
            components,
            consecutive_stable: self.consecutive_stable,
            at: now,
        }
    }

    /// 1.0 at zero bar-to-bar movement, 0.0 at the threshold and beyond.
    fn volatility_score(&self, closes: &[f64]) -> f64 {
        let returns: Vec<f64> = closes
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| ((w[1] - w[0]) / w[0]).abs())
            .collect();
        if returns.is_empty() {
            return 0.0;
        }
        (1.0 - mean(&returns) / self.params.volatility_threshold).clamp(0.0, 1.0)
    }

    /// Averages the absolute short-span and half-window momentum.
    fn momentum_score(&self, closes: &[f64]) -> f64 {
        let short = momentum_over(closes, SHORT_MOMENTUM_SPAN);
        let half = momentum_over(closes, closes.len() / 2);
        let (Some(short), Some(half)) = (short, half) else {
            return 0.0;
        };
        let avg = (short.abs() + half.abs()) / 2.0;
        (1.0 - avg / self.params.momentum_threshold).clamp(0.0, 1.0)
    }

    /// Compares the high-low range of the later half of the window
    /// against the earlier half. Full credit when the ratio is at or
    /// under the target, linear partial credit up to a flat range.
    fn range_contraction_score(&self, candles: &[Candle]) -> f64 {
        let mid = candles.len() / 2;
        let earlier = half_range(&candles[..mid]);
        let later = half_range(&candles[mid..]);
        if earlier <= 0.0 {
            return 0.5;
        }
        let ratio = later / earlier;
        if ratio <= self.params.range_contraction_target {
            return 1.0;
        }
        ((1.0 - ratio) / (1.0 - self.params.range_contraction_target)).clamp(0.0, 1.0)
    }
}

/// Fractional change over the last `span` bars
fn momentum_over(closes: &[f64], span: usize) -> Option<f64> {
    if span == 0 || closes.len() <= span {
        return None;
    }
    let base = closes[closes.len() - 1 - span];
    if base <= 0.0 {
        return None;
    }
    Some((closes[closes.len() - 1] - base) / base)
}

fn half_range(candles: &[Candle]) -> f64 {
    let mut hi = f64::MIN;
    let mut lo = f64::MAX;
    for c in candles {
        hi = hi.max(c.high.0);
        lo = lo.min(c.low.0);
    }
    if candles.is_empty() { 0.0 } else { hi - lo }
}

/// Coefficient of variation of closes, inverse-scaled against the 1%
/// target.
fn conformity_score(closes: &[f64]) -> f64 {
    let m = mean(closes);
    if m <= 0.0 {
        return 0.0;
    }
    let cv = std_dev(closes) / m;
    (1.0 - cv / CONFORMITY_TARGET_CV).clamp(0.0, 1.0)
}

/// 1.0 when both windows trend the same way (or both are flat),
/// 0.5 when exactly one is flat, 0.0 when they conflict.
fn trend_consistency_score(primary: &[Candle], secondary: &[Candle]) -> f64 {
    let p = window_trend(primary);
    let s = window_trend(secondary);
    match (p, s) {
        (Some(a), Some(b)) => {
            if a == 0 && b == 0 {
                1.0
            } else if a == 0 || b == 0 {
                0.5
            } else if a == b {
                1.0
            } else {
                0.0
            }
        }
        // a missing secondary window is treated as flat
        (Some(_), None) | (None, Some(_)) => 0.5,
        (None, None) => 0.5,
    }
}

/// Sign of the window's close-to-close drift: -1, 0 (flat) or 1.
fn window_trend(candles: &[Candle]) -> Option<i8> {
    let first = candles.first()?.close.0;
    let last = candles.last()?.close.0;
    if first <= 0.0 {
        return None;
    }
    let drift = (last - first) / first;
    if drift.abs() < TREND_THRESHOLD {
        Some(0)
    } else if drift > 0.0 {
        Some(1)
    } else {
        Some(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market::types::{Price, Qty, TimestampMs};

    fn candle(close: f64, spread: f64) -> Candle {
        Candle {
            ts: TimestampMs(0),
            open: Price(close),
            high: Price(close + spread),
            low: Price(close - spread),
            close: Price(close),
            volume: Qty(1000.0),
        }
    }

    fn flat_window(n: usize) -> Vec<Candle> {
        (0..n).map(|_| candle(100.0, 0.05)).collect()
    }

    fn choppy_window(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = if i % 2 == 0 { 98.0 } else { 103.0 };
                candle(close, 2.0)
            })
            .collect()
    }

    #[test]
    fn insufficient_history_gives_zero_confidence_unknown() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        let sig = det.analyze(&flat_window(3), &flat_window(3), Utc::now());
        assert!(!sig.is_stable);
        assert_eq!(sig.confidence, 0.0);
        assert_eq!(sig.risk, RiskLevel::Unknown);
        assert_eq!(sig.action, StabilityAction::MaintainBreakout);
    }

    #[test]
    fn flat_market_reads_stable_and_low_risk() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        let sig = det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        assert!(sig.is_stable, "score {} should be stable", sig.score);
        assert_eq!(sig.risk, RiskLevel::Low);
        assert_eq!(sig.action, StabilityAction::Monitor);
    }

    #[test]
    fn choppy_market_reads_unstable_and_high_risk() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        let sig = det.analyze(&choppy_window(10), &choppy_window(5), Utc::now());
        assert!(!sig.is_stable);
        assert_eq!(sig.risk, RiskLevel::High);
        assert_eq!(sig.action, StabilityAction::MaintainBreakout);
        assert_eq!(sig.consecutive_stable, 0);
    }

    #[test]
    fn three_stable_reads_return_to_grid() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        let primary = flat_window(10);
        let secondary = flat_window(5);

        let first = det.analyze(&primary, &secondary, Utc::now());
        assert_eq!(first.action, StabilityAction::Monitor);
        let second = det.analyze(&primary, &secondary, Utc::now());
        assert_eq!(second.action, StabilityAction::Monitor);
        let third = det.analyze(&primary, &secondary, Utc::now());
        assert_eq!(third.action, StabilityAction::ReturnToGrid);
        assert_eq!(third.consecutive_stable, 3);
    }

    #[test]
    fn unstable_read_breaks_the_streak() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        det.analyze(&choppy_window(10), &choppy_window(5), Utc::now());
        let sig = det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        assert_eq!(sig.consecutive_stable, 1);
        assert_eq!(sig.action, StabilityAction::Monitor);
    }

    #[test]
    fn stability_threshold_is_inclusive() {
        // components that weight to exactly 0.70
        let c = ScoreComponents {
            volatility: 1.0,   // 0.30
            momentum: 1.0,     // 0.25
            range_contraction: 0.0,
            conformity: 1.0,   // 0.15
            trend_consistency: 0.0,
        };
        let score = c.weighted();
        assert!((score - 0.70).abs() < 1e-12);
        assert!(score >= StabilityParams::default().stability_threshold);
    }

    #[test]
    fn conflicting_trends_zero_the_consistency_score() {
        let rising: Vec<Candle> = (0..10).map(|i| candle(100.0 + i as f64, 0.1)).collect();
        let falling: Vec<Candle> = (0..5).map(|i| candle(105.0 - i as f64, 0.1)).collect();
        assert_eq!(trend_consistency_score(&rising, &falling), 0.0);
        assert_eq!(trend_consistency_score(&rising, &rising), 1.0);

        let flat = flat_window(5);
        assert_eq!(trend_consistency_score(&rising, &flat), 0.5);
        assert_eq!(trend_consistency_score(&flat, &flat), 1.0);
    }

    #[test]
    fn stats_track_the_check_rate() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        // too little history is not a scored check
        det.analyze(&flat_window(3), &flat_window(3), Utc::now());
        assert_eq!(det.stats(), StabilityStats::default());
        assert_eq!(det.stats().stability_rate(), 0.0);

        det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        det.analyze(&choppy_window(10), &choppy_window(5), Utc::now());
        let stats = det.stats();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.stable_checks, 1);
        assert!((stats.stability_rate() - 0.5).abs() < 1e-12);

        // a new episode keeps the running totals
        det.reset();
        assert_eq!(det.stats().total_checks, 2);
    }

    #[test]
    fn reset_clears_the_streak() {
        let mut det = StabilityDetector::new(StabilityParams::default());
        det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        det.reset();
        let sig = det.analyze(&flat_window(10), &flat_window(5), Utc::now());
        assert_eq!(sig.consecutive_stable, 1);
    }
}
