//! Shared bot state. One live instance per orchestrator, guarded by a
//! single `RwLock`; everything exposed outward is a copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use market::types::{Money, Price, Qty};
use signal::breakout::{BreakoutDirection, BreakoutStats, GridBounds};
use signal::false_breakout::ReversalKind;
use signal::stability::StabilityStats;
use state_machine::mode::Mode;

/// One breakout episode, from detection until the bot is back in Grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutContext {
    pub direction: BreakoutDirection,
    pub detected_at: DateTime<Utc>,
    pub entry_price: Price,
    pub confirmed: bool,
    pub false_breakout: bool,
    pub recovery: Option<ReversalKind>,
    /// Size of the position opened for this episode
    pub position_qty: Qty,
    /// Set when Stability mode starts waiting for calm
    pub stability_wait_started: Option<DateTime<Utc>>,
}

impl BreakoutContext {
    pub fn new(direction: BreakoutDirection, entry_price: Price, at: DateTime<Utc>) -> Self {
        Self {
            direction,
            detected_at: at,
            entry_price,
            confirmed: false,
            false_breakout: false,
            recovery: None,
            position_qty: Qty(0.0),
            stability_wait_started: None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub trades: u64,
    pub equity: Money,
    pub peak_equity: Money,
    pub total_pnl: Money,
    pub drawdown: f64,
    pub updated_at: DateTime<Utc>,
}

impl PerformanceMetrics {
    fn new(starting_balance: Money, at: DateTime<Utc>) -> Self {
        Self {
            trades: 0,
            equity: starting_balance,
            peak_equity: starting_balance,
            total_pnl: Money(0.0),
            drawdown: 0.0,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotState {
    pub mode: Mode,
    pub symbol: String,
    pub bounds: Option<GridBounds>,
    pub breakout: Option<BreakoutContext>,
    pub paused: bool,
    pub performance: PerformanceMetrics,
    pub last_transition: DateTime<Utc>,
    /// Bumped on every processed market event and transition; the
    /// liveness worker watches this.
    pub last_update: DateTime<Utc>,
}

impl BotState {
    pub fn new(symbol: impl Into<String>, starting_balance: Money) -> Self {
        let now = Utc::now();
        Self {
            mode: Mode::Idle,
            symbol: symbol.into(),
            bounds: None,
            breakout: None,
            paused: false,
            performance: PerformanceMetrics::new(starting_balance, now),
            last_transition: now,
            last_update: now,
        }
    }
}

/// Read-only copy of the bot's externally visible state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    #[serde(serialize_with = "mode_as_str")]
    pub mode: Mode,
    pub symbol: String,
    pub paused: bool,
    pub bounds: Option<GridBounds>,
    pub breakout_direction: Option<BreakoutDirection>,
    pub performance: PerformanceMetrics,
    pub breakout_stats: BreakoutStats,
    pub stability_stats: StabilityStats,
    pub risk_health: Option<risk::RiskHealth>,
    pub last_transition: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

// the state machine crate stays serde-free; render the mode by name
fn mode_as_str<S: serde::Serializer>(mode: &Mode, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(mode)
}
