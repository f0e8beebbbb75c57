//! Engine configuration. Everything has a workable default; a JSON file
//! overrides the parts it names.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use execution::model::ExecutionModel;
use market::candle::Timeframe;
use risk::RiskParams;
use signal::breakout::BreakoutParams;
use signal::false_breakout::FalseBreakoutParams;
use signal::stability::StabilityParams;

use crate::analyzer::IndicatorParams;
use crate::grid::GridSetupParams;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerIntervals {
    pub risk_ms: u64,
    pub liveness_ms: u64,
    pub performance_ms: u64,
    /// No state update for this long outside Idle/Grid forces Grid
    pub inactivity_window_ms: u64,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            risk_ms: 1_000,
            liveness_ms: 5_000,
            performance_ms: 1_000,
            inactivity_window_ms: 30_000,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapParams {
    pub poll_ms: u64,
    pub timeout_ms: u64,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            poll_ms: 3_000,
            timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSizes {
    pub market_events: usize,
    pub signals: usize,
    pub control: usize,
}

impl Default for ChannelSizes {
    fn default() -> Self {
        Self {
            market_events: 2_048,
            signals: 256,
            control: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub symbol: String,
    pub starting_balance: f64,
    pub leverage: f64,
    /// Fraction of equity committed to a breakout position
    pub breakout_position_fraction: f64,
    /// Size factor of the flipped position after a hard reversal
    pub reverse_size_factor: f64,
    /// Timeframe detectors and indicators run on
    pub analysis_timeframe: Timeframe,
    /// Shorter timeframe for the stability cross-check
    pub stability_secondary_timeframe: Timeframe,
    pub stability_primary_window: usize,
    pub stability_secondary_window: usize,
    /// Grace period for flattening positions during shutdown
    pub shutdown_grace_ms: u64,
    pub breakout: BreakoutParams,
    pub false_breakout: FalseBreakoutParams,
    pub stability: StabilityParams,
    pub risk: RiskParams,
    pub grid: GridSetupParams,
    pub indicators: IndicatorParams,
    pub execution: ExecutionModel,
    pub intervals: WorkerIntervals,
    pub bootstrap: BootstrapParams,
    pub channels: ChannelSizes,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            starting_balance: 10_000.0,
            leverage: 5.0,
            breakout_position_fraction: 0.10,
            reverse_size_factor: 0.80,
            analysis_timeframe: Timeframe::S1,
            stability_secondary_timeframe: Timeframe::S1,
            stability_primary_window: 10,
            stability_secondary_window: 5,
            shutdown_grace_ms: 5_000,
            breakout: BreakoutParams::default(),
            false_breakout: FalseBreakoutParams::default(),
            stability: StabilityParams::default(),
            risk: RiskParams::default(),
            grid: GridSetupParams::default(),
            indicators: IndicatorParams::default(),
            execution: ExecutionModel::default(),
            intervals: WorkerIntervals::default(),
            bootstrap: BootstrapParams::default(),
            channels: ChannelSizes::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = Config::default();
        assert!(cfg.breakout_position_fraction > 0.0 && cfg.breakout_position_fraction < 1.0);
        assert_eq!(cfg.stability.window, cfg.stability_primary_window);
        assert!(cfg.intervals.inactivity_window_ms > cfg.intervals.liveness_ms);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let cfg: Config =
            serde_json::from_str(r#"{"symbol":"ETHUSDT","leverage":10.0}"#).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.leverage, 10.0);
        assert_eq!(cfg.starting_balance, 10_000.0);
        assert_eq!(cfg.risk, RiskParams::default());
    }
}
