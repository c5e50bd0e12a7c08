//! Error handling.
//!
//! Error types are grouped by who sees them:
//! - **Callers**: [`AdmissionError`], [`TicketError`], [`LimitedCallError`]
//! - **Operators**: [`MonitorError`], [`ConfigError`], [`SessionError`],
//!   [`InitializationError`]
//! - **Internal**: [`ProbeError`] only extends the blocked backoff

mod types;

// Re-export public API
pub use types::{
    AdmissionError, ConfigError, InitializationError, LimitedCallError, MonitorError, ProbeError,
    SessionError, TicketError,
};
