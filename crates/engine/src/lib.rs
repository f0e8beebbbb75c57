//! Mode orchestrator: owns the bot state, runs the worker topology and
//! turns detector signals into validated mode transitions and position
//! actions.

pub mod aggregator;
pub mod analyzer;
pub mod collab;
pub mod config;
pub mod event;
pub mod grid;
pub mod orchestrator;
pub mod state;

pub use config::Config;
pub use orchestrator::{ControlHandle, Orchestrator};
pub use state::StatusSnapshot;
