//! Configuration constants.
//!
//! Defaults for the admission engine, the recovery prober and the monitor.

use std::time::Duration;

/// Requests per minute applied to engines without an explicit override.
pub const DEFAULT_RATE_LIMIT: u32 = 300;

/// Environment variable consulted for the log directory when none is configured.
pub const LOG_DIRECTORY_ENV_VAR: &str = "RATELLMITER_LOGS";
/// Relative log directory used when neither config nor environment names one.
pub const DEFAULT_LOG_DIRECTORY: &str = "ratellmiter_logs";
/// Extension of the append-only session logs.
pub const LOG_FILE_EXTENSION: &str = "jsonl";

/// Service name of the built-in service that never reports a block.
pub const DEFAULT_SERVICE_NAME: &str = "default";

// Engine clock
/// How often the engine driver calls `tick()`.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Time for `current_rate` to climb from the floor to the configured ceiling.
pub const DEFAULT_RAMP_DURATION: Duration = Duration::from_secs(10);
/// Without demand for this long the ramp starts over from the floor.
pub const DEFAULT_IDLE_RESET: Duration = Duration::from_secs(5);
/// Fraction of the ceiling used as the ramp floor (the original started at 25%).
pub const RAMP_FLOOR_FRACTION: f64 = 0.25;
/// Width of the rolling window the ceiling is enforced over.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Non-priority requests are refused once this many tickets are waiting.
pub const DEFAULT_QUEUE_BOUND: usize = 10_000;

// Recovery prober
/// First probe delay after a block.
pub const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(10);
/// Probe delay never grows past this.
pub const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(65);
/// Multiplier applied to the probe delay after each still-blocked answer.
pub const PROBE_BACKOFF_RATE: f64 = 1.5;

/// Attempts `call_limited_default` makes before giving up on a rejected call.
pub const RATE_LIMIT_RETRIES: usize = 20;

// Monitor
/// How often the monitor samples every engine.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
/// Events kept for retry after failed log writes before the oldest are dropped.
pub const MAX_PENDING_EVENTS: usize = 10_000;
