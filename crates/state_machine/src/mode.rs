use std::fmt;

/// Operating modes of the trading controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Waiting for the market to become suitable
    Idle,
    /// Normal range trading inside the grid band
    Grid,
    /// A band breach is being tracked and managed
    Breakout,
    /// Unwinding after a failed breakout
    Recovery,
    /// Confirmed breakout waiting for the market to settle
    Stability,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Idle => "idle",
            Mode::Grid => "grid",
            Mode::Breakout => "breakout",
            Mode::Recovery => "recovery",
            Mode::Stability => "stability",
        };
        write!(f, "{s}")
    }
}
