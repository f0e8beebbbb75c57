//! Seeded random-walk tick generator, for demos and soak runs without
//! market data on hand.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc::Sender;
use tokio::time::{Duration, sleep};
use tracing::info;

use market::candle::Tick;
use market::types::{Price, Qty, TimestampMs};

use crate::MarketEvent;

pub struct SyntheticFeed {
    start_price: f64,
    /// Per-tick return stddev-ish scale as a fraction of price
    volatility: f64,
    tick_interval: Duration,
    /// 0 means run until the receiver drops
    max_ticks: u64,
    rng: StdRng,
}

impl SyntheticFeed {
    pub fn new(
        start_price: f64,
        volatility: f64,
        tick_interval: Duration,
        max_ticks: u64,
        seed: u64,
    ) -> Self {
        Self {
            start_price,
            volatility,
            tick_interval,
            max_ticks,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub async fn run(mut self, tx: Sender<MarketEvent>) -> Result<()> {
        let mut price = self.start_price;
        let mut ts = chrono::Utc::now().timestamp_millis();
        let step = self.tick_interval.as_millis() as i64;
        let mut sent = 0u64;

        loop {
            if self.max_ticks > 0 && sent >= self.max_ticks {
                break;
            }

            let ret: f64 = self.rng.gen_range(-self.volatility..=self.volatility);
            price = (price * (1.0 + ret)).max(f64::MIN_POSITIVE);
            let volume: f64 = self.rng.gen_range(100.0..=2_000.0);

            let tick = Tick {
                ts: TimestampMs(ts),
                price: Price(price),
                volume: Qty(volume),
            };
            if tx.send(MarketEvent::Tick(tick)).await.is_err() {
                break;
            }

            sent += 1;
            ts += step;
            sleep(self.tick_interval).await;
        }

        info!(ticks = sent, "synthetic feed finished");
        Ok(())
    }
}
