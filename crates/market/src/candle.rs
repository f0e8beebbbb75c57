use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Price, Qty, TimestampMs};

/// One OHLCV candle
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: TimestampMs,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Qty,
}

impl Candle {
    /// Candle body as a fraction of the open (signed)
    pub fn body_pct(&self) -> f64 {
        if self.open.0 <= 0.0 {
            return 0.0;
        }
        (self.close.0 - self.open.0) / self.open.0
    }
}

/// Single trade / price tick
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub ts: TimestampMs,
    pub price: Price,
    pub volume: Qty,
}

/// Candle timeframes the aggregator rolls ticks into
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    S1,
    S3,
    S15,
    S30,
    M1,
}

impl Timeframe {
    pub fn duration(self) -> Duration {
        match self {
            Timeframe::S1 => Duration::from_secs(1),
            Timeframe::S3 => Duration::from_secs(3),
            Timeframe::S15 => Duration::from_secs(15),
            Timeframe::S30 => Duration::from_secs(30),
            Timeframe::M1 => Duration::from_secs(60),
        }
    }

    pub fn millis(self) -> i64 {
        self.duration().as_millis() as i64
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::S1 => "1s",
            Timeframe::S3 => "3s",
            Timeframe::S15 => "15s",
            Timeframe::S30 => "30s",
            Timeframe::M1 => "1m",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_pct_is_signed() {
        let mut c = Candle {
            ts: TimestampMs(0),
            open: Price(100.0),
            high: Price(102.0),
            low: Price(99.0),
            close: Price(101.0),
            volume: Qty(10.0),
        };
        assert!((c.body_pct() - 0.01).abs() < 1e-12);

        c.close = Price(99.0);
        assert!(c.body_pct() < 0.0);
    }

    #[test]
    fn timeframe_millis() {
        assert_eq!(Timeframe::S3.millis(), 3_000);
        assert_eq!(Timeframe::M1.millis(), 60_000);
    }
}
