//! Process-level initialization for binaries embedding the rate limiter.

mod logger;

// Re-export public API
pub use logger::init_logger_with;
