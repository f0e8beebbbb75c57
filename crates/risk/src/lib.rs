//! Portfolio risk assessment.
//!
//! Folds drawdown, margin usage, position concentration and market
//! volatility into one 0..1 score, grades it, and escalates to a
//! flatten-everything directive when margin usage crosses the call line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use market::types::Money;

/// Score weights
const W_DRAWDOWN: f64 = 0.30;
const W_MARGIN: f64 = 0.30;
const W_CONCENTRATION: f64 = 0.20;
const W_VOLATILITY: f64 = 0.20;

/// 5% volatility saturates its component
const VOLATILITY_SCALE: f64 = 20.0;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParams {
    /// Drawdown fraction that saturates the drawdown component (20%)
    pub max_drawdown: f64,
    /// Margin usage at or above which positions are force-closed
    pub margin_call_threshold: f64,
    pub critical_threshold: f64,
    pub warning_threshold: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_drawdown: 0.20,
            margin_call_threshold: 0.90,
            critical_threshold: 0.80,
            warning_threshold: 0.60,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskHealth {
    Healthy,
    Warning,
    Critical,
}

/// Emergency instruction the orchestrator must act on immediately
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmergencyDirective {
    FlattenAll,
}

/// One open position's share of the book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionExposure {
    pub symbol: String,
    pub notional: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskInputs {
    pub portfolio_value: Money,
    pub peak_value: Money,
    pub used_margin: Money,
    pub positions: Vec<PositionExposure>,
    /// Recent market volatility as a fraction of price
    pub volatility: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    /// 0..1
    pub overall: f64,
    pub health: RiskHealth,
    pub drawdown: f64,
    pub margin_usage: f64,
    /// Herfindahl index of position notionals, 0..1
    pub concentration: f64,
    pub margin_call_risk: bool,
    pub directive: Option<EmergencyDirective>,
    pub breached: Vec<String>,
    pub at: DateTime<Utc>,
}

pub struct RiskAssessor {
    params: RiskParams,
}

impl RiskAssessor {
    pub fn new(params: RiskParams) -> Self {
        Self { params }
    }

    /// Grades the book. A zero or negative portfolio value is treated as
    /// maximal risk, never as a division error.
    pub fn assess(&self, inputs: &RiskInputs, now: DateTime<Utc>) -> RiskVerdict {
        if inputs.portfolio_value.0 <= 0.0 {
            return RiskVerdict {
                overall: 1.0,
                health: RiskHealth::Critical,
                drawdown: 1.0,
                margin_usage: 1.0,
                concentration: herfindahl(&inputs.positions),
                margin_call_risk: true,
                directive: Some(EmergencyDirective::FlattenAll),
                breached: vec!["portfolio value exhausted".to_string()],
                at: now,
            };
        }

        let drawdown = drawdown(inputs.peak_value, inputs.portfolio_value);
        let margin_usage = (inputs.used_margin.0 / inputs.portfolio_value.0).max(0.0);
        let concentration = herfindahl(&inputs.positions);

        let overall = (drawdown / self.params.max_drawdown).min(1.0) * W_DRAWDOWN
            + margin_usage.min(1.0) * W_MARGIN
            + concentration * W_CONCENTRATION
            + (inputs.volatility * VOLATILITY_SCALE).min(1.0) * W_VOLATILITY;
        let overall = overall.clamp(0.0, 1.0);

        let health = if overall >= self.params.critical_threshold {
            RiskHealth::Critical
        } else if overall >= self.params.warning_threshold {
            RiskHealth::Warning
        } else {
            RiskHealth::Healthy
        };

        let margin_call_risk = margin_usage >= self.params.margin_call_threshold;

        let mut breached = Vec::new();
        if drawdown >= self.params.max_drawdown {
            breached.push(format!("drawdown {:.1}% at limit", drawdown * 100.0));
        }
        if margin_call_risk {
            breached.push(format!("margin usage {:.0}% past call line", margin_usage * 100.0));
        }
        if health == RiskHealth::Critical {
            breached.push("overall risk critical".to_string());
        }

        RiskVerdict {
            overall,
            health,
            drawdown,
            margin_usage,
            concentration,
            margin_call_risk,
            directive: margin_call_risk.then_some(EmergencyDirective::FlattenAll),
            breached,
            at: now,
        }
    }
}

/// Fraction lost from the peak, clamped to 0..1
fn drawdown(peak: Money, current: Money) -> f64 {
    if peak.0 <= 0.0 {
        return 0.0;
    }
    ((peak.0 - current.0) / peak.0).clamp(0.0, 1.0)
}

/// Sum of squared notional weights. Empty book reads as zero risk,
/// a single position as fully concentrated.
fn herfindahl(positions: &[PositionExposure]) -> f64 {
    let total: f64 = positions.iter().map(|p| p.notional.0.abs()).sum();
    if total <= 0.0 {
        return 0.0;
    }
    positions
        .iter()
        .map(|p| {
            let w = p.notional.0.abs() / total;
            w * w
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assessor() -> RiskAssessor {
        RiskAssessor::new(RiskParams::default())
    }

    fn inputs() -> RiskInputs {
        RiskInputs {
            portfolio_value: Money(10_000.0),
            peak_value: Money(10_000.0),
            used_margin: Money(0.0),
            positions: Vec::new(),
            volatility: 0.0,
        }
    }

    fn pos(symbol: &str, notional: f64) -> PositionExposure {
        PositionExposure {
            symbol: symbol.to_string(),
            notional: Money(notional),
        }
    }

    #[test]
    fn calm_flat_book_is_healthy() {
        let v = assessor().assess(&inputs(), Utc::now());
        assert_eq!(v.overall, 0.0);
        assert_eq!(v.health, RiskHealth::Healthy);
        assert!(!v.margin_call_risk);
        assert!(v.directive.is_none());
        assert!(v.breached.is_empty());
    }

    #[test]
    fn exhausted_portfolio_is_maximal_risk() {
        let mut i = inputs();
        i.portfolio_value = Money(0.0);
        let v = assessor().assess(&i, Utc::now());
        assert_eq!(v.overall, 1.0);
        assert_eq!(v.health, RiskHealth::Critical);
        assert_eq!(v.directive, Some(EmergencyDirective::FlattenAll));
    }

    #[test]
    fn weights_add_up() {
        let mut i = inputs();
        // every component saturated
        i.peak_value = Money(20_000.0);
        i.portfolio_value = Money(10_000.0); // 50% drawdown, caps at max
        i.used_margin = Money(10_000.0); // 100% usage
        i.positions = vec![pos("BTCUSDT", 5_000.0)]; // HHI 1.0
        i.volatility = 0.10; // saturates at 5%
        let v = assessor().assess(&i, Utc::now());
        assert!((v.overall - 1.0).abs() < 1e-9);
        assert_eq!(v.health, RiskHealth::Critical);
    }

    #[test]
    fn margin_call_line_is_inclusive() {
        let mut i = inputs();
        i.used_margin = Money(9_000.0);
        let v = assessor().assess(&i, Utc::now());
        assert!(v.margin_call_risk);
        assert_eq!(v.directive, Some(EmergencyDirective::FlattenAll));

        i.used_margin = Money(8_900.0);
        let v = assessor().assess(&i, Utc::now());
        assert!(!v.margin_call_risk);
        assert!(v.directive.is_none());
    }

    #[test]
    fn health_thresholds_are_inclusive() {
        let mut i = inputs();
        // margin 100% -> 0.30, volatility saturated -> 0.20,
        // drawdown 10% of the 20% limit -> 0.15, HHI split book -> 0.10,
        // total 0.75: warning band
        i.peak_value = Money(10_000.0);
        i.portfolio_value = Money(9_000.0);
        i.used_margin = Money(9_000.0);
        i.positions = vec![pos("BTCUSDT", 3_000.0), pos("ETHUSDT", 3_000.0)];
        i.volatility = 0.10;
        let v = assessor().assess(&i, Utc::now());
        assert!((v.overall - 0.75).abs() < 1e-9);
        assert_eq!(v.health, RiskHealth::Warning);

        // single-name book pushes concentration to 1.0: 0.85, critical
        i.positions = vec![pos("BTCUSDT", 6_000.0)];
        let v = assessor().assess(&i, Utc::now());
        assert!((v.overall - 0.85).abs() < 1e-9);
        assert_eq!(v.health, RiskHealth::Critical);
    }

    #[test]
    fn concentration_of_equal_positions() {
        assert_eq!(herfindahl(&[]), 0.0);
        assert_eq!(herfindahl(&[pos("A", 100.0)]), 1.0);
        let two = herfindahl(&[pos("A", 100.0), pos("B", 100.0)]);
        assert!((two - 0.5).abs() < 1e-12);
        // shorts count by absolute notional
        let mixed = herfindahl(&[pos("A", 100.0), pos("B", -100.0)]);
        assert!((mixed - 0.5).abs() < 1e-12);
    }

    #[test]
    fn drawdown_is_relative_to_peak() {
        assert_eq!(drawdown(Money(10_000.0), Money(10_000.0)), 0.0);
        assert_eq!(drawdown(Money(10_000.0), Money(7_500.0)), 0.25);
        assert_eq!(drawdown(Money(10_000.0), Money(12_000.0)), 0.0);
        assert_eq!(drawdown(Money(0.0), Money(1_000.0)), 0.0);
    }
}
