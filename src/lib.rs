//! ratellmiter: ticket-issuing admission control for rate-limited APIs
//!
//! Calls to an LLM endpoint go through an [`AdmissionEngine`], which issues
//! tickets at a rate that ramps up to the endpoint's requests-per-minute
//! ceiling. A call rejected upstream is reported back; the engine stops
//! issuing until its prober sees the upstream recover, then serves the
//! rejected callers first. A [`Monitor`] owns engines per service and model
//! and records their activity to JSONL session logs that the `ratellmiter`
//! binary prints back.
//!
//! # Example
//!
//! ```no_run
//! use ratellmiter::{call_limited, Monitor, MonitorConfig, UpstreamRejection};
//!
//! #[derive(Debug)]
//! struct ApiError(u16);
//!
//! impl UpstreamRejection for ApiError {
//!     fn is_upstream_rejection(&self) -> bool {
//!         self.0 == 429
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let monitor = Monitor::new();
//! monitor.start(MonitorConfig {
//!     default_rate_limit: 500,
//!     ..Default::default()
//! })?;
//!
//! let engine = monitor.get_or_create_engine("openai", Some("gpt-4o"))?;
//! let reply = call_limited(&engine, "request-1", 20, || async {
//!     Ok::<_, ApiError>("hello".to_string())
//! })
//! .await;
//! println!("{:?}", reply.is_ok());
//!
//! monitor.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Requirements
//!
//! Engine drivers and the monitor run as tokio tasks, so they must be started
//! inside a Tokio runtime.

#![warn(missing_docs)]

pub mod admission;
pub mod config;
mod error_handling;
pub mod initialization;
pub mod monitor;
pub mod session;

// Re-export public API
pub use admission::{
    call_limited, call_limited_default, AdmissionEngine, BlockState, Clock,
    DefaultRateLimitedService, DriverHandle, EngineSnapshot, EventCounts, EventKind, ManualClock,
    RateLimitedService, Ticket, TicketGuard, TicketId, TicketOutcome, TicketRecord, TicketWaiter,
    TokioClock, UpstreamRejection,
};
pub use config::{EngineConfig, LogFormat, LogLevel, MonitorConfig, ProbeConfig};
pub use error_handling::{
    AdmissionError, ConfigError, InitializationError, LimitedCallError, MonitorError, ProbeError,
    SessionError, TicketError,
};
pub use monitor::{EngineKey, EventListener, LogEvent, Monitor};
