use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::info;

use engine::aggregator::CandleAggregator;
use engine::analyzer::IndicatorEngine;
use engine::collab::CandleSource;
use engine::config::Config;
use engine::grid::RangeGridAnalysis;
use engine::orchestrator::Orchestrator;
use execution::paper::PaperExecutor;
use feed::replay::ReplayFeed;
use feed::synthetic::SyntheticFeed;
use market::types::Money;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FeedKind {
    Replay,
    Synthetic,
}

#[derive(Debug, Parser)]
#[command(name = "gridbot", about = "mode-orchestrated grid trading bot")]
struct Args {
    /// Trading symbol
    #[arg(long)]
    symbol: Option<String>,

    /// JSON config file (defaults apply otherwise)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FeedKind::Synthetic)]
    feed: FeedKind,

    /// CSV candle file for the replay feed
    #[arg(long)]
    data: Option<PathBuf>,

    /// Synthetic feed starting price
    #[arg(long, default_value_t = 100.0)]
    start_price: f64,

    /// Synthetic feed per-tick volatility
    #[arg(long, default_value_t = 0.002)]
    volatility: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine=info,feed=info,gridbot=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(symbol) = args.symbol {
        cfg.symbol = symbol;
    }

    let mut timeframes = vec![cfg.analysis_timeframe];
    if cfg.stability_secondary_timeframe != cfg.analysis_timeframe {
        timeframes.push(cfg.stability_secondary_timeframe);
    }
    let aggregator = Arc::new(CandleAggregator::new(timeframes));
    let candles: Arc<dyn CandleSource> = aggregator.clone();

    let indicators = Arc::new(IndicatorEngine::new(
        candles.clone(),
        cfg.analysis_timeframe,
        cfg.indicators,
    ));
    let grid = Arc::new(RangeGridAnalysis::new(candles, cfg.grid));
    let executor = Arc::new(PaperExecutor::new(
        Money(cfg.starting_balance),
        cfg.leverage,
        cfg.execution,
    ));

    let (tx, rx) = mpsc::channel(cfg.channels.market_events);
    match args.feed {
        FeedKind::Replay => {
            let path = args.data.context("--data is required with --feed replay")?;
            let replay = ReplayFeed::new(path, cfg.analysis_timeframe, None);
            tokio::spawn(async move {
                if let Err(e) = replay.run(tx).await {
                    tracing::error!("replay feed failed: {e:#}");
                }
            });
        }
        FeedKind::Synthetic => {
            let synthetic = SyntheticFeed::new(
                args.start_price,
                args.volatility,
                Duration::from_millis(50),
                0,
                args.seed,
            );
            tokio::spawn(async move {
                if let Err(e) = synthetic.run(tx).await {
                    tracing::error!("synthetic feed failed: {e:#}");
                }
            });
        }
    }

    info!(symbol = %cfg.symbol, feed = ?args.feed, "starting orchestrator");
    let orchestrator = Orchestrator::new(cfg, aggregator, indicators, grid, executor);

    let run = orchestrator.run(rx);
    tokio::pin!(run);
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs.max(1)));
    tokio::pin!(deadline);

    tokio::select! {
        res = &mut run => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            orchestrator.shutdown();
            run.await?;
        }
        _ = &mut deadline, if args.duration_secs > 0 => {
            info!("run duration elapsed, shutting down");
            orchestrator.shutdown();
            run.await?;
        }
    }

    let status = orchestrator.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
