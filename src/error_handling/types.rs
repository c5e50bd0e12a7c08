//! Error type definitions.
//!
//! This module defines all error types surfaced by the admission engine, the
//! monitor, the session reader and the limited-call wrapper.

use std::path::PathBuf;

use log::SetLoggerError;
use thiserror::Error;

use crate::admission::TicketId;

/// Error types for initialization failures.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)] // All variants end with "Error" by convention
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),
}

/// Invalid engine configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A ceiling of zero requests per minute would never admit anything.
    #[error("rate limit must be at least 1 request per minute")]
    ZeroRateLimit,

    /// An interval that drives a loop was zero.
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    /// Probe backoff below 1.0 would shorten the delay after each failure.
    #[error("probe backoff must be >= 1.0, got {0}")]
    InvalidBackoff(f64),
}

/// Reasons a request for a ticket did not produce one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The queue already holds `bound` non-priority requests.
    #[error("admission queue full ({queue_length} waiting, bound {bound})")]
    Overflow {
        /// Tickets waiting when the request arrived
        queue_length: usize,
        /// Configured queue bound
        bound: usize,
    },

    /// The engine (or its monitor) stopped while the request was pending.
    #[error("admission engine is shutting down")]
    ShuttingDown,

    /// The caller gave up waiting; recorded as abandoned.
    #[error("ticket request abandoned before issue")]
    Abandoned,
}

/// Misuse of a ticket's close transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// The ticket already carries an outcome.
    #[error("ticket {0} is already closed")]
    AlreadyClosed(TicketId),

    /// The engine has no record of this ticket being outstanding.
    #[error("ticket {0} is not outstanding on this engine")]
    NotOutstanding(TicketId),
}

/// A recovery probe could not determine the upstream state.
///
/// Never reaches callers; the prober logs it and keeps backing off.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("probe failed: {0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    /// Wraps any displayable failure.
    pub fn new(message: impl Into<String>) -> Self {
        ProbeError(message.into())
    }
}

/// Error types for monitor lifecycle and registry operations.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// `start()` on a monitor that is already running.
    #[error("monitor is already running")]
    AlreadyRunning,

    /// Registry access on a monitor that is not running.
    #[error("monitor is not running")]
    NotRunning,

    /// The log directory could not be created.
    #[error("cannot create log directory {path}: {source}")]
    LogDirectory {
        /// Directory that was requested
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// An engine config derived from the monitor config is invalid.
    #[error("invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Error types for reading session logs back.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The directory holds no non-empty session log.
    #[error("no session logs with data in {0}")]
    NoLogFiles(PathBuf),

    /// The session holds no events for the requested engine.
    #[error("no events for '{name}' in {file}")]
    NoMatchingData {
        /// Engine name that was requested
        name: String,
        /// Session file that was read
        file: PathBuf,
    },

    /// Reading the directory or file failed.
    #[error("I/O error reading {path}: {source}")]
    Io {
        /// File or directory being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of [`crate::call_limited`] when it does not return a value.
#[derive(Error, Debug)]
pub enum LimitedCallError<E> {
    /// No ticket could be obtained.
    #[error("admission failed: {0}")]
    Admission(#[from] AdmissionError),

    /// Every attempt was rejected upstream.
    #[error("upstream rejected all {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: usize,
        /// The rejection from the last attempt
        last: E,
    },

    /// The engine refused to close the ticket.
    #[error("ticket error: {0}")]
    Ticket(#[from] TicketError),

    /// The work failed for a reason other than upstream rejection.
    #[error("call failed: {0}")]
    Inner(E),
}
