//! Market data sources.
//!
//! A feed is an owned task that pushes [`MarketEvent`]s into a channel
//! until it runs out of data or the receiver goes away. Two sources are
//! provided: CSV candle replay and a seeded random walk.

pub mod replay;
pub mod synthetic;

use market::candle::{Candle, Tick, Timeframe};

/// Market data events
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Tick(Tick),
    Candle { timeframe: Timeframe, candle: Candle },
}

impl MarketEvent {
    pub fn tick(&self) -> Option<&Tick> {
        match self {
            MarketEvent::Tick(t) => Some(t),
            MarketEvent::Candle { .. } => None,
        }
    }
}
