//! Configuration and constants.
//!
//! This module provides:
//! - Default timings and limits for engines, the prober and the monitor
//! - Engine and monitor configuration structs
//! - CLI option types for the log inspection binary

mod constants;
mod types;

// Re-export all constants
pub use constants::*;
pub use types::{EngineConfig, LogFormat, LogLevel, MonitorConfig, Opt, ProbeConfig};
