//! CSV candle replay.
//!
//! Rows are `ts,open,high,low,close,volume` with `ts` in epoch millis.
//! Each row is re-emitted as a closed base-timeframe candle plus a tick
//! at the close, so downstream aggregation behaves the same as on a
//! live stream.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc::Sender;
use tokio::time::{Duration, sleep};
use tracing::info;

use market::candle::{Candle, Tick, Timeframe};
use market::types::{Price, Qty, TimestampMs};

use crate::MarketEvent;

#[derive(Debug, Deserialize)]
struct CandleRow {
    ts: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl CandleRow {
    fn into_candle(self) -> Candle {
        Candle {
            ts: TimestampMs(self.ts),
            open: Price(self.open),
            high: Price(self.high),
            low: Price(self.low),
            close: Price(self.close),
            volume: Qty(self.volume),
        }
    }
}

pub struct ReplayFeed {
    path: PathBuf,
    timeframe: Timeframe,
    /// Delay between rows; `None` replays as fast as the receiver drains
    pace: Option<Duration>,
}

impl ReplayFeed {
    pub fn new(path: impl Into<PathBuf>, timeframe: Timeframe, pace: Option<Duration>) -> Self {
        Self {
            path: path.into(),
            timeframe,
            pace,
        }
    }

    pub async fn run(self, tx: Sender<MarketEvent>) -> Result<()> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("open replay file {}", self.path.display()))?;

        let mut rows = 0usize;
        for record in reader.deserialize() {
            let row: CandleRow = record.context("malformed replay row")?;
            let candle = row.into_candle();
            let tick = Tick {
                ts: candle.ts,
                price: candle.close,
                volume: candle.volume,
            };

            if tx
                .send(MarketEvent::Candle {
                    timeframe: self.timeframe,
                    candle,
                })
                .await
                .is_err()
            {
                break;
            }
            if tx.send(MarketEvent::Tick(tick)).await.is_err() {
                break;
            }
            rows += 1;

            if let Some(pace) = self.pace {
                sleep(pace).await;
            }
        }

        info!(rows, "replay finished");
        Ok(())
    }
}
