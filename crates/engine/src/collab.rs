//! Collaborator seams the orchestrator consumes.
//!
//! Everything behind these traits is replaceable in tests; the
//! orchestrator only holds one-directional references down to them.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use market::candle::{Candle, Timeframe};
use market::types::{Money, Price, Qty};
use signal::IndicatorSnapshot;
use signal::breakout::GridBounds;

/// Read access to aggregated candles.
pub trait CandleSource: Send + Sync {
    /// Last `count` completed candles, most recent last.
    fn candles(&self, timeframe: Timeframe, count: usize) -> Vec<Candle>;

    /// The candle currently being built (or the last completed one if
    /// nothing is in flight).
    fn current_candle(&self, timeframe: Timeframe) -> Option<Candle>;

    fn latest_price(&self) -> Option<Price>;
}

/// Technical indicator snapshots. `None` until enough history exists.
pub trait IndicatorSource: Send + Sync {
    fn snapshot(&self) -> Option<IndicatorSnapshot>;
}

/// Output of grid analysis: the band plus sizing for one grid cycle.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridPlan {
    pub bounds: GridBounds,
    pub levels: u32,
    pub qty_per_level: Qty,
}

/// Market-suitability gate and grid sizing.
pub trait GridAnalysis: Send + Sync {
    /// `Err(reason)` while the market is not suitable for grid trading.
    /// Not-yet-suitable is expected during bootstrap, not a fault.
    fn should_setup(&self) -> Result<(), String>;

    fn analyze(&self, balance: Money) -> Result<GridPlan>;
}
