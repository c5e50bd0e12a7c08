//! Configuration types and CLI options.
//!
//! Library configuration is plain structs with `Default` impls so they can be
//! built programmatically; only [`Opt`] depends on `clap`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::config::constants::{
    DEFAULT_IDLE_RESET, DEFAULT_LOG_DIRECTORY, DEFAULT_QUEUE_BOUND, DEFAULT_RAMP_DURATION,
    DEFAULT_RATE_LIMIT, DEFAULT_SAMPLE_INTERVAL, DEFAULT_SERVICE_NAME, DEFAULT_TICK_INTERVAL,
    LOG_DIRECTORY_ENV_VAR, MAX_PROBE_INTERVAL, MIN_PROBE_INTERVAL, PROBE_BACKOFF_RATE,
};
use crate::error_handling::ConfigError;

/// Logging level for the application.
///
/// Controls the verbosity of log output, from most restrictive (Error) to most
/// verbose (Trace).
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format.
///
/// - `Plain`: Human-readable format with colors (default)
/// - `Json`: Structured JSON format for machine parsing
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Timing of the recovery prober.
///
/// The probe delay starts at `min_interval`, is multiplied by `backoff` after
/// every answer that still reports a block, and never exceeds `max_interval`.
/// A `backoff` of `1.0` probes at a fixed interval.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// First delay after the engine becomes blocked
    pub min_interval: Duration,
    /// Upper bound for the delay
    pub max_interval: Duration,
    /// Growth factor per failed probe (>= 1.0)
    pub backoff: f64,
}

impl ProbeConfig {
    /// Fixed-interval probing, mostly useful in tests and simulations.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            min_interval: interval,
            max_interval: interval,
            backoff: 1.0,
        }
    }

    /// Returns the delay that follows `current` after another blocked answer.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff).min(self.max_interval)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            min_interval: MIN_PROBE_INTERVAL,
            max_interval: MAX_PROBE_INTERVAL,
            backoff: PROBE_BACKOFF_RATE,
        }
    }
}

/// Configuration of a single admission engine.
///
/// # Examples
///
/// ```
/// use ratellmiter::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     rate_limit: 60,
///     ramp_duration: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Ceiling in requests per minute (`R`)
    pub rate_limit: u32,
    /// Interval between driver ticks
    pub tick_interval: Duration,
    /// Time to ramp from the floor rate up to `rate_limit`
    pub ramp_duration: Duration,
    /// Idle time after which the ramp restarts from the floor
    pub idle_reset: Duration,
    /// Maximum waiting non-priority tickets (`None` for unbounded)
    pub queue_bound: Option<usize>,
    /// Recovery prober timing
    pub probe: ProbeConfig,
}

impl EngineConfig {
    /// Default configuration with a different ceiling.
    pub fn with_rate_limit(rate_limit: u32) -> Self {
        Self {
            rate_limit,
            ..Default::default()
        }
    }

    /// Checks the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for a zero rate limit, a zero tick or probe
    /// interval, or a probe backoff below `1.0`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit == 0 {
            return Err(ConfigError::ZeroRateLimit);
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("tick_interval"));
        }
        if self.probe.min_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("probe.min_interval"));
        }
        if !(self.probe.backoff >= 1.0) {
            return Err(ConfigError::InvalidBackoff(self.probe.backoff));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            tick_interval: DEFAULT_TICK_INTERVAL,
            ramp_duration: DEFAULT_RAMP_DURATION,
            idle_reset: DEFAULT_IDLE_RESET,
            queue_bound: Some(DEFAULT_QUEUE_BOUND),
            probe: ProbeConfig::default(),
        }
    }
}

/// Monitor configuration (recognized options at startup).
///
/// # Examples
///
/// ```no_run
/// use ratellmiter::MonitorConfig;
/// use std::path::PathBuf;
///
/// let config = MonitorConfig {
///     default_rate_limit: 500,
///     log_directory: Some(PathBuf::from("/var/log/ratellmiter")),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Requests per minute for engines with no override
    pub default_rate_limit: u32,
    /// Directory for the append-only event logs
    ///
    /// `None` falls back to `$RATELLMITER_LOGS`, then `./ratellmiter_logs`.
    pub log_directory: Option<PathBuf>,
    /// Interval between samples written to the log
    pub sample_interval: Duration,
    /// Template for new engines; its `rate_limit` is replaced per engine
    pub engine: EngineConfig,
    /// Per-engine ceilings keyed by engine name (`service` or `service/model`)
    pub rate_limit_overrides: HashMap<String, u32>,
}

impl MonitorConfig {
    /// Resolves the log directory from config, environment, or the default.
    pub fn resolved_log_directory(&self) -> PathBuf {
        if let Some(dir) = &self.log_directory {
            return dir.clone();
        }
        match std::env::var_os(LOG_DIRECTORY_ENV_VAR) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from(DEFAULT_LOG_DIRECTORY),
        }
    }

    /// Engine configuration for the engine called `engine_name`.
    pub fn engine_config_for(&self, engine_name: &str) -> EngineConfig {
        let rate_limit = self
            .rate_limit_overrides
            .get(engine_name)
            .copied()
            .unwrap_or(self.default_rate_limit);
        EngineConfig {
            rate_limit,
            ..self.engine.clone()
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: DEFAULT_RATE_LIMIT,
            log_directory: None,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            engine: EngineConfig::default(),
            rate_limit_overrides: HashMap::new(),
        }
    }
}

/// Command-line options for the `ratellmiter` log inspection binary.
///
/// # Examples
///
/// ```bash
/// # Most recent session, default service, all series
/// ratellmiter
///
/// # Issued tickets and exceptions for one model from a given file
/// ratellmiter --name openai/gpt-4o --file 1718000000.jsonl --lines ie
/// ```
#[derive(Debug, Parser)]
#[command(
    name = "ratellmiter",
    about = "Prints the per-interval request flow recorded by the rate limiter monitor."
)]
pub struct Opt {
    /// Directory holding the session logs (default: $RATELLMITER_LOGS or ./ratellmiter_logs)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Engine name to show (`service` or `service/model`)
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    pub name: String,

    /// Session log file inside the directory (default: most recent with data)
    #[arg(long)]
    pub file: Option<String>,

    /// Series to print: r=requests, i=issued, e=exceptions, f=finished, o=overflow, a=abandoned
    #[arg(long, default_value = "iroef")]
    pub lines: String,

    /// Log level: error|warn|info|debug|trace
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Log format: plain|json
    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,
}
