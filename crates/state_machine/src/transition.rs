use std::fmt;

use crate::mode::Mode;

#[derive(Debug, PartialEq, Eq)]
pub enum TransitionError {
    IllegalTransition { from: Mode, to: Mode },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::IllegalTransition { from, to } => {
                write!(f, "transition {from} -> {to} is not allowed")
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// Modes directly reachable from `from`. The graph is fixed:
/// Idle -> Grid is the only entry edge, and every non-idle mode can
/// reach Grid again.
pub fn allowed_from(from: Mode) -> &'static [Mode] {
    match from {
        Mode::Idle => &[Mode::Grid],
        Mode::Grid => &[Mode::Breakout, Mode::Recovery],
        Mode::Breakout => &[Mode::Stability, Mode::Recovery, Mode::Grid],
        Mode::Stability => &[Mode::Grid, Mode::Breakout],
        Mode::Recovery => &[Mode::Grid],
    }
}

pub fn validate(from: Mode, to: Mode) -> Result<(), TransitionError> {
    if allowed_from(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalTransition { from, to })
    }
}
