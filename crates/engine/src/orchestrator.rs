//! The orchestrator: six workers plus a bootstrap task around one
//! shared `BotState`.
//!
//! Detectors are owned by the ingestion worker and never see shared
//! state; they emit [`TradingSignal`]s which the signal worker turns
//! into validated transitions and position actions. The risk worker can
//! pre-empt everything with a flatten-and-idle directive.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use execution::{Execution, Side};
use feed::MarketEvent;
use market::types::{Money, Price, Qty};
use risk::{
    EmergencyDirective, PositionExposure, RiskAssessor, RiskHealth, RiskInputs, RiskVerdict,
};
use signal::breakout::{BreakoutDetector, BreakoutDirection, BreakoutStats, OPEN_CONFIDENCE};
use signal::false_breakout::{FalseBreakoutDetector, ReversalKind};
use signal::stability::{RiskLevel, StabilityAction, StabilityDetector, StabilityStats};
use state_machine::mode::Mode;
use state_machine::transition;

use crate::aggregator::CandleAggregator;
use crate::collab::{CandleSource, GridAnalysis, IndicatorSource};
use crate::config::Config;
use crate::event::{ControlCommand, TradingSignal};
use crate::state::{BotState, BreakoutContext, StatusSnapshot};

/// Handle for the operator control queue. Full queue drops the newest
/// command instead of blocking the caller.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub fn send(&self, cmd: ControlCommand) {
        if self.tx.try_send(cmd).is_err() {
            warn!(?cmd, "control queue full, dropping command");
        }
    }
}

struct Core {
    cfg: Config,
    state: RwLock<BotState>,
    aggregator: Arc<CandleAggregator>,
    indicators: Arc<dyn IndicatorSource>,
    grid: Arc<dyn GridAnalysis>,
    execution: Arc<dyn Execution>,
    last_risk: RwLock<Option<RiskVerdict>>,
    breakout_stats: RwLock<BreakoutStats>,
    stability_stats: RwLock<StabilityStats>,
    shutdown: watch::Sender<bool>,
}

pub struct Orchestrator {
    core: Arc<Core>,
    control_tx: mpsc::Sender<ControlCommand>,
    control_rx: Mutex<Option<mpsc::Receiver<ControlCommand>>>,
}

impl Orchestrator {
    pub fn new(
        cfg: Config,
        aggregator: Arc<CandleAggregator>,
        indicators: Arc<dyn IndicatorSource>,
        grid: Arc<dyn GridAnalysis>,
        execution: Arc<dyn Execution>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(cfg.channels.control);
        let state = BotState::new(cfg.symbol.clone(), Money(cfg.starting_balance));
        let (shutdown, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                cfg,
                state: RwLock::new(state),
                aggregator,
                indicators,
                grid,
                execution,
                last_risk: RwLock::new(None),
                breakout_stats: RwLock::new(BreakoutStats::default()),
                stability_stats: RwLock::new(StabilityStats::default()),
                shutdown,
            }),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            tx: self.control_tx.clone(),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.core.status()
    }

    /// Broadcasts cancellation to every worker.
    pub fn shutdown(&self) {
        let _ = self.core.shutdown.send(true);
    }

    /// Requests a transition through the normal graph.
    pub fn switch_mode(&self, to: Mode) -> Result<()> {
        self.core.switch_mode(to, None)
    }

    /// Forces a mode outside the graph (no-op when already there).
    pub fn force_mode(&self, to: Mode) -> Result<()> {
        self.core.force_mode(to)
    }

    /// Runs the worker topology until the event stream ends or
    /// [`shutdown`](Self::shutdown) is called, then flattens positions.
    pub async fn run(&self, events: mpsc::Receiver<MarketEvent>) -> Result<()> {
        let control_rx = self
            .take_control_rx()
            .context("orchestrator is already running")?;
        let (signal_tx, signal_rx) = mpsc::channel(self.core.cfg.channels.signals);

        let mut workers = JoinSet::new();
        workers.spawn(ingestion_worker(self.core.clone(), events, signal_tx));
        workers.spawn(signal_worker(self.core.clone(), signal_rx));
        workers.spawn(risk_worker(self.core.clone()));
        workers.spawn(liveness_worker(self.core.clone()));
        workers.spawn(performance_worker(self.core.clone()));
        workers.spawn(control_worker(self.core.clone(), control_rx));
        workers.spawn(bootstrap_task(self.core.clone()));

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker panicked: {e}");
                self.shutdown();
            }
        }

        let grace = StdDuration::from_millis(self.core.cfg.shutdown_grace_ms);
        self.core
            .flatten_with_retry(grace)
            .await
            .context("shutdown anomaly: could not flatten positions")?;
        info!("orchestrator stopped");
        Ok(())
    }

    fn take_control_rx(&self) -> Option<mpsc::Receiver<ControlCommand>> {
        let mut slot = match self.control_rx.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        slot.take()
    }
}

// --- detector bundle (ingestion-worker local) ---

struct Detectors {
    breakout: BreakoutDetector,
    false_breakout: FalseBreakoutDetector,
    stability: StabilityDetector,
    last_mode: Mode,
    last_stability_ts: Option<i64>,
}

impl Detectors {
    fn new(cfg: &Config) -> Self {
        Self {
            breakout: BreakoutDetector::new(cfg.breakout),
            false_breakout: FalseBreakoutDetector::new(cfg.false_breakout),
            stability: StabilityDetector::new(cfg.stability),
            last_mode: Mode::Idle,
            last_stability_ts: None,
        }
    }

    fn on_mode(&mut self, mode: Mode) {
        if mode == self.last_mode {
            return;
        }
        if mode == Mode::Breakout && self.last_mode == Mode::Grid {
            // fresh episode
            self.false_breakout.reset();
            self.stability.reset();
            self.last_stability_ts = None;
        }
        self.last_mode = mode;
    }
}

// --- workers ---

async fn ingestion_worker(
    core: Arc<Core>,
    mut events: mpsc::Receiver<MarketEvent>,
    signals: mpsc::Sender<TradingSignal>,
) {
    let mut det = Detectors::new(&core.cfg);
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                core.on_market_event(&ev, &mut det, &signals).await;
            }
        }
    }
    // event stream is gone, nothing left to orchestrate
    let _ = core.shutdown.send(true);
    debug!("ingestion worker stopped");
}

async fn signal_worker(core: Arc<Core>, mut signals: mpsc::Receiver<TradingSignal>) {
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            sig = signals.recv() => {
                let Some(sig) = sig else { break };
                if let Err(e) = core.handle_signal(sig) {
                    warn!("signal dropped: {e:#}");
                }
            }
        }
    }
    debug!("signal worker stopped");
}

async fn risk_worker(core: Arc<Core>) {
    let assessor = RiskAssessor::new(core.cfg.risk);
    let grace = StdDuration::from_millis(core.cfg.shutdown_grace_ms);
    let mut ticker = interval(StdDuration::from_millis(core.cfg.intervals.risk_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let verdict = core.assess_risk(&assessor);
                match verdict.health {
                    RiskHealth::Critical => {
                        warn!(risk = verdict.overall, breached = ?verdict.breached, "risk critical")
                    }
                    RiskHealth::Warning => {
                        info!(risk = verdict.overall, "risk warning")
                    }
                    RiskHealth::Healthy => {}
                }
                let directive = verdict.directive;
                *core.write(&core.last_risk) = Some(verdict);

                if directive == Some(EmergencyDirective::FlattenAll) {
                    if let Err(e) = core.flatten_with_retry(grace).await {
                        error!("emergency flatten failed: {e:#}");
                    }
                    if let Err(e) = core.force_mode(Mode::Idle) {
                        error!("emergency idle failed: {e:#}");
                    }
                }
            }
        }
    }
    debug!("risk worker stopped");
}

async fn liveness_worker(core: Arc<Core>) {
    let window = Duration::milliseconds(core.cfg.intervals.inactivity_window_ms as i64);
    let mut ticker = interval(StdDuration::from_millis(core.cfg.intervals.liveness_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let (mode, last_update) = {
                    let st = core.read(&core.state);
                    (st.mode, st.last_update)
                };
                if matches!(mode, Mode::Idle | Mode::Grid) {
                    continue;
                }
                if Utc::now() - last_update > window {
                    warn!(%mode, "no state updates within the inactivity window, forcing grid");
                    if let Err(e) = core.force_mode(Mode::Grid) {
                        error!("liveness recovery failed: {e:#}");
                    }
                }
            }
        }
    }
    debug!("liveness worker stopped");
}

async fn performance_worker(core: Arc<Core>) {
    let mut ticker = interval(StdDuration::from_millis(core.cfg.intervals.performance_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let account = core.execution.account();
                let mut st = core.write(&core.state);
                let perf = &mut st.performance;
                perf.equity = account.equity;
                perf.peak_equity = account.peak_equity;
                perf.total_pnl = Money(account.equity.0 - core.cfg.starting_balance);
                perf.drawdown = if account.peak_equity.0 > 0.0 {
                    ((account.peak_equity.0 - account.equity.0) / account.peak_equity.0).max(0.0)
                } else {
                    0.0
                };
                perf.updated_at = Utc::now();
            }
        }
    }
    debug!("performance worker stopped");
}

async fn control_worker(core: Arc<Core>, mut commands: mpsc::Receiver<ControlCommand>) {
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    ControlCommand::Pause => {
                        core.write(&core.state).paused = true;
                        info!("paused by operator");
                    }
                    ControlCommand::Resume => {
                        core.write(&core.state).paused = false;
                        info!("resumed by operator");
                    }
                    ControlCommand::SwitchMode(to) => {
                        if let Err(e) = core.switch_mode(to, None) {
                            warn!(%to, "operator transition rejected: {e:#}");
                        }
                    }
                }
            }
        }
    }
    debug!("control worker stopped");
}

/// Idle-to-Grid promotion: poll the suitability gate until it passes or
/// the overall timeout expires.
async fn bootstrap_task(core: Arc<Core>) {
    let deadline = tokio::time::Instant::now()
        + StdDuration::from_millis(core.cfg.bootstrap.timeout_ms);
    let mut ticker = interval(StdDuration::from_millis(core.cfg.bootstrap.poll_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shutdown = core.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                if core.read(&core.state).mode != Mode::Idle {
                    return;
                }
                match core.grid.should_setup() {
                    Ok(()) => match core.switch_mode(Mode::Grid, None) {
                        Ok(()) => {
                            info!("bootstrap complete, grid trading active");
                            return;
                        }
                        Err(e) => warn!("bootstrap grid setup failed: {e:#}"),
                    },
                    Err(reason) => debug!(%reason, "market not yet suitable"),
                }
                if tokio::time::Instant::now() >= deadline {
                    error!("bootstrap timed out, staying idle");
                    return;
                }
            }
        }
    }
}

// --- core logic ---

impl Core {
    fn read<'a, T>(&self, lock: &'a RwLock<T>) -> RwLockReadGuard<'a, T> {
        match lock.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn write<'a, T>(&self, lock: &'a RwLock<T>) -> RwLockWriteGuard<'a, T> {
        match lock.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    fn status(&self) -> StatusSnapshot {
        let st = self.read(&self.state);
        StatusSnapshot {
            mode: st.mode,
            symbol: st.symbol.clone(),
            paused: st.paused,
            bounds: st.bounds,
            breakout_direction: st.breakout.as_ref().map(|c| c.direction),
            performance: st.performance,
            breakout_stats: *self.read(&self.breakout_stats),
            stability_stats: *self.read(&self.stability_stats),
            risk_health: self.read(&self.last_risk).as_ref().map(|v| v.health),
            last_transition: st.last_transition,
            last_update: st.last_update,
        }
    }

    // --- transitions ---

    fn switch_mode(&self, to: Mode, ctx: Option<BreakoutContext>) -> Result<()> {
        let mut st = self.write(&self.state);
        transition::validate(st.mode, to)?;
        self.enter_mode(&mut st, to, ctx)
    }

    /// Emergency/liveness path: skips graph validation, still runs the
    /// mode setup, and is a no-op when the mode already matches.
    fn force_mode(&self, to: Mode) -> Result<()> {
        let mut st = self.write(&self.state);
        if st.mode == to {
            return Ok(());
        }
        info!(%to, "forced transition");
        self.enter_mode(&mut st, to, None)
    }

    fn enter_mode(&self, st: &mut BotState, to: Mode, ctx: Option<BreakoutContext>) -> Result<()> {
        let now = Utc::now();
        match to {
            Mode::Grid => {
                let balance = self.execution.account().equity;
                let plan = self.grid.analyze(balance)?;
                st.bounds = Some(plan.bounds);
                st.breakout = None;
            }
            Mode::Breakout => {
                if let Some(ctx) = ctx {
                    st.breakout = Some(ctx);
                }
                if st.breakout.is_none() {
                    bail!("breakout mode requires a breakout context");
                }
            }
            Mode::Stability => {
                let ctx = st
                    .breakout
                    .as_mut()
                    .context("stability mode requires a breakout context")?;
                ctx.stability_wait_started = Some(now);
            }
            Mode::Recovery => {
                if st.breakout.is_none() {
                    bail!("recovery mode requires a breakout context");
                }
            }
            Mode::Idle => {
                st.bounds = None;
                st.breakout = None;
            }
        }

        let from = st.mode;
        st.mode = to;
        st.last_transition = now;
        st.last_update = now;
        info!(%from, %to, "mode transition");
        Ok(())
    }

    // --- ingestion path ---

    async fn on_market_event(
        &self,
        event: &MarketEvent,
        det: &mut Detectors,
        signals: &mpsc::Sender<TradingSignal>,
    ) {
        self.aggregator.apply(event);
        let price = match event {
            MarketEvent::Tick(t) => t.price,
            MarketEvent::Candle { candle, .. } => candle.close,
        };
        self.execution.mark(&self.cfg.symbol, price);

        let (mode, paused, bounds, episode) = {
            let mut st = self.write(&self.state);
            st.last_update = Utc::now();
            (st.mode, st.paused, st.bounds, st.breakout.clone())
        };
        if paused {
            return;
        }
        det.on_mode(mode);

        match mode {
            Mode::Idle => {}
            Mode::Grid => self.process_grid(price, bounds, det, signals).await,
            Mode::Breakout => self.process_breakout(price, episode, det, signals).await,
            Mode::Stability => self.run_stability_check(det, signals).await,
            Mode::Recovery => self.process_recovery(episode, signals).await,
        }
    }

    async fn process_grid(
        &self,
        price: Price,
        bounds: Option<signal::breakout::GridBounds>,
        det: &mut Detectors,
        signals: &mpsc::Sender<TradingSignal>,
    ) {
        // settle an episode left over from a forced return to grid
        if det.breakout.tracking() {
            if det.breakout.confirm(price, Utc::now()).is_some() {
                *self.write(&self.breakout_stats) = det.breakout.stats();
            }
            return;
        }

        let Some(bounds) = bounds else { return };
        let snapshot = self.indicators.snapshot();
        let candle = self.aggregator.current_candle(self.cfg.analysis_timeframe);

        let sig = det.breakout.detect(
            bounds,
            price,
            snapshot.as_ref(),
            candle.as_ref(),
            Utc::now(),
        );
        *self.write(&self.breakout_stats) = det.breakout.stats();

        if let Some(sig) = sig {
            if sig.confidence >= OPEN_CONFIDENCE {
                let _ = signals.send(TradingSignal::Breakout(sig)).await;
            }
        }
    }

    async fn process_breakout(
        &self,
        price: Price,
        episode: Option<BreakoutContext>,
        det: &mut Detectors,
        signals: &mpsc::Sender<TradingSignal>,
    ) {
        let Some(ctx) = episode else { return };

        if ctx.confirmed {
            // confirmed breakout waiting for calm
            self.run_stability_check(det, signals).await;
            return;
        }

        let now = Utc::now();
        if let Some(valid) = det.breakout.confirm(price, now) {
            *self.write(&self.breakout_stats) = det.breakout.stats();
            let _ = signals.send(TradingSignal::BreakoutSettled { valid }).await;
            return;
        }

        let snapshot = self.indicators.snapshot();
        let atr = snapshot.as_ref().map(|s| s.atr).unwrap_or(0.0);
        let volume = self
            .aggregator
            .current_candle(self.cfg.analysis_timeframe)
            .map(|c| c.volume.0)
            .unwrap_or(0.0);
        let elapsed = now - ctx.detected_at;

        let sig = det.false_breakout.detect(
            ctx.entry_price,
            price,
            ctx.direction,
            atr,
            volume,
            elapsed,
        );
        if let Some(sig) = sig {
            if sig.confidence >= OPEN_CONFIDENCE {
                det.breakout.abort_episode();
                *self.write(&self.breakout_stats) = det.breakout.stats();
                let _ = signals.send(TradingSignal::FalseBreakout(sig)).await;
            }
        }
    }

    /// Runs stability analysis once per completed primary candle.
    async fn run_stability_check(&self, det: &mut Detectors, signals: &mpsc::Sender<TradingSignal>) {
        let primary = self
            .aggregator
            .candles(self.cfg.analysis_timeframe, self.cfg.stability_primary_window);
        let latest_ts = primary.last().map(|c| c.ts.0);
        if latest_ts.is_none() || latest_ts == det.last_stability_ts {
            return;
        }
        det.last_stability_ts = latest_ts;

        let secondary = self.aggregator.candles(
            self.cfg.stability_secondary_timeframe,
            self.cfg.stability_secondary_window,
        );
        let sig = det.stability.analyze(&primary, &secondary, Utc::now());
        *self.write(&self.stability_stats) = det.stability.stats();
        let _ = signals.send(TradingSignal::StabilityUpdate(sig)).await;
    }

    async fn process_recovery(
        &self,
        episode: Option<BreakoutContext>,
        signals: &mpsc::Sender<TradingSignal>,
    ) {
        let Some(ctx) = episode else { return };
        let flat = self.execution.position(&self.cfg.symbol).is_none();
        // a reversed position is handed over to normal management
        if flat || ctx.recovery == Some(ReversalKind::Reverse) {
            let _ = signals.send(TradingSignal::RecoveryComplete).await;
        }
    }

    // --- signal handling ---

    fn handle_signal(&self, sig: TradingSignal) -> Result<()> {
        match sig {
            TradingSignal::Breakout(sig) => {
                if self.read(&self.state).mode != Mode::Grid {
                    return Ok(());
                }
                info!(
                    direction = ?sig.direction,
                    confidence = sig.confidence,
                    price = %sig.price,
                    "breakout detected"
                );
                let ctx = BreakoutContext::new(sig.direction, sig.price, sig.at);
                self.switch_mode(Mode::Breakout, Some(ctx))?;
                self.open_breakout_position(sig.direction, sig.price)?;
            }
            TradingSignal::BreakoutSettled { valid } => {
                if self.read(&self.state).mode != Mode::Breakout {
                    return Ok(());
                }
                if valid {
                    info!("breakout confirmed");
                    self.write(&self.state)
                        .breakout
                        .as_mut()
                        .context("confirmed breakout without a context")?
                        .confirmed = true;
                    self.switch_mode(Mode::Stability, None)?;
                } else {
                    info!("breakout reverted before confirmation");
                    self.mark_false(ReversalKind::StopLoss)?;
                    self.switch_mode(Mode::Recovery, None)?;
                    self.execute_recovery(ReversalKind::StopLoss)?;
                }
            }
            TradingSignal::FalseBreakout(sig) => {
                if self.read(&self.state).mode != Mode::Breakout {
                    return Ok(());
                }
                warn!(
                    confidence = sig.confidence,
                    reversal = ?sig.reversal,
                    reasons = ?sig.reasons,
                    "false breakout"
                );
                self.mark_false(sig.reversal)?;
                self.switch_mode(Mode::Recovery, None)?;
                self.execute_recovery(sig.reversal)?;
            }
            TradingSignal::StabilityUpdate(sig) => {
                let mode = self.read(&self.state).mode;
                match sig.action {
                    StabilityAction::ReturnToGrid
                        if mode == Mode::Breakout || mode == Mode::Stability =>
                    {
                        info!(score = sig.score, "market stable, returning to grid");
                        self.close_episode_position()?;
                        self.switch_mode(Mode::Grid, None)?;
                    }
                    StabilityAction::Monitor if mode == Mode::Breakout => {
                        self.switch_mode(Mode::Stability, None)?;
                    }
                    StabilityAction::MaintainBreakout
                        if mode == Mode::Stability && sig.risk != RiskLevel::Unknown =>
                    {
                        info!(score = sig.score, "stability lost, back to breakout management");
                        self.switch_mode(Mode::Breakout, None)?;
                    }
                    _ => {}
                }
            }
            TradingSignal::RecoveryComplete => {
                if self.read(&self.state).mode != Mode::Recovery {
                    return Ok(());
                }
                info!("recovery complete");
                self.switch_mode(Mode::Grid, None)?;
            }
        }
        Ok(())
    }

    fn mark_false(&self, kind: ReversalKind) -> Result<()> {
        let mut st = self.write(&self.state);
        let ctx = st
            .breakout
            .as_mut()
            .context("no breakout episode to mark false")?;
        ctx.false_breakout = true;
        ctx.recovery = Some(kind);
        Ok(())
    }

    // --- position actions ---

    fn open_breakout_position(&self, direction: BreakoutDirection, price: Price) -> Result<()> {
        let equity = self.execution.account().equity;
        let qty = Qty(equity.0 * self.cfg.breakout_position_fraction / price.0.max(f64::EPSILON));
        let side = match direction {
            BreakoutDirection::Up => Side::Long,
            BreakoutDirection::Down => Side::Short,
        };
        let fill = self.execution.open(&self.cfg.symbol, side, qty, price)?;
        info!(?side, qty = %fill.qty, price = %fill.price, "breakout position opened");

        let mut st = self.write(&self.state);
        if let Some(ctx) = st.breakout.as_mut() {
            ctx.position_qty = fill.qty;
        }
        st.performance.trades += 1;
        Ok(())
    }

    fn execute_recovery(&self, kind: ReversalKind) -> Result<()> {
        let price = self
            .aggregator
            .latest_price()
            .context("no price for recovery action")?;
        let (direction, prior_qty) = {
            let st = self.read(&self.state);
            let ctx = st.breakout.as_ref().context("no episode to recover")?;
            (ctx.direction, ctx.position_qty)
        };

        if self.execution.close(&self.cfg.symbol, price)?.is_some() {
            info!(?kind, %price, "episode position closed");
            self.write(&self.state).performance.trades += 1;
        }

        if kind == ReversalKind::Reverse {
            let qty = Qty(prior_qty.0 * self.cfg.reverse_size_factor);
            if qty.0 > 0.0 {
                let side = match direction.opposite() {
                    BreakoutDirection::Up => Side::Long,
                    BreakoutDirection::Down => Side::Short,
                };
                let fill = self.execution.open(&self.cfg.symbol, side, qty, price)?;
                info!(?side, qty = %fill.qty, "reversed into opposite position");
                self.write(&self.state).performance.trades += 1;
            }
        }
        Ok(())
    }

    fn close_episode_position(&self) -> Result<()> {
        let Some(price) = self.aggregator.latest_price() else {
            return Ok(());
        };
        if self.execution.close(&self.cfg.symbol, price)?.is_some() {
            info!(%price, "episode position closed on stability");
            self.write(&self.state).performance.trades += 1;
        }
        Ok(())
    }

    fn flatten_once(&self) -> Result<()> {
        if self.execution.position(&self.cfg.symbol).is_none() {
            return Ok(());
        }
        let price = self
            .aggregator
            .latest_price()
            .context("no price to flatten against")?;
        if self.execution.close(&self.cfg.symbol, price)?.is_some() {
            info!(%price, "position flattened");
            self.write(&self.state).performance.trades += 1;
        }
        Ok(())
    }

    /// Closes out positions, retrying until the grace deadline.
    async fn flatten_with_retry(&self, grace: StdDuration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match self.flatten_once() {
                Ok(()) => return Ok(()),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(e.context("flatten retries exhausted"));
                }
                Err(e) => {
                    warn!("flatten attempt failed, retrying: {e:#}");
                    sleep(StdDuration::from_millis(100)).await;
                }
            }
        }
    }

    // --- risk ---

    fn assess_risk(&self, assessor: &RiskAssessor) -> RiskVerdict {
        let account = self.execution.account();
        let positions = self
            .execution
            .position(&self.cfg.symbol)
            .map(|p| {
                vec![PositionExposure {
                    symbol: p.symbol.clone(),
                    notional: p.notional(),
                }]
            })
            .unwrap_or_default();
        let volatility = self
            .indicators
            .snapshot()
            .filter(|s| s.price.0 > 0.0)
            .map(|s| s.atr / s.price.0)
            .unwrap_or(0.0);

        assessor.assess(
            &RiskInputs {
                portfolio_value: account.equity,
                peak_value: account.peak_equity,
                used_margin: account.used_margin,
                positions,
                volatility,
            },
            Utc::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::IndicatorEngine;
    use crate::grid::RangeGridAnalysis;
    use execution::paper::PaperExecutor;
    use market::candle::{Candle, Timeframe};
    use market::types::TimestampMs;
    use signal::stability::{ScoreComponents, StabilitySignal};

    fn seeded_core() -> Arc<Core> {
        let cfg = Config::default();
        let aggregator = Arc::new(CandleAggregator::new(vec![cfg.analysis_timeframe]));
        for i in 0..60i64 {
            let close = if i % 2 == 0 { 99.5 } else { 100.5 };
            aggregator.apply(&MarketEvent::Candle {
                timeframe: Timeframe::S1,
                candle: Candle {
                    ts: TimestampMs(i * 1_000),
                    open: Price(close),
                    high: Price(close + 0.5),
                    low: Price(close - 0.5),
                    close: Price(close),
                    volume: Qty(1_000.0),
                },
            });
        }
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
        Orchestrator::new(cfg, aggregator, indicators, grid, executor).core
    }

    #[test]
    fn stale_return_to_grid_is_ignored_outside_an_episode() {
        let core = seeded_core();
        // suitability would pass, so only the mode guard keeps a stale
        // queued stability verdict from promoting Idle to Grid
        assert!(core.grid.should_setup().is_ok());

        let sig = StabilitySignal {
            is_stable: true,
            score: 0.9,
            confidence: 0.9,
            risk: RiskLevel::Low,
            action: StabilityAction::ReturnToGrid,
            components: ScoreComponents::default(),
            consecutive_stable: 3,
            at: Utc::now(),
        };
        core.handle_signal(TradingSignal::StabilityUpdate(sig))
            .unwrap();
        assert_eq!(core.read(&core.state).mode, Mode::Idle);
    }
}
