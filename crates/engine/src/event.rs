use signal::breakout::BreakoutSignal;
use signal::false_breakout::FalseBreakoutSignal;
use signal::stability::StabilitySignal;
use state_machine::mode::Mode;

/// Detector output handed from the ingestion worker to the
/// signal-processing worker.
#[derive(Debug, Clone)]
pub enum TradingSignal {
    Breakout(BreakoutSignal),
    /// Confirmation verdict on the tracked breakout episode
    BreakoutSettled { valid: bool },
    FalseBreakout(FalseBreakoutSignal),
    StabilityUpdate(StabilitySignal),
    RecoveryComplete,
}

/// Operator commands accepted on the control queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    SwitchMode(Mode),
}
