//! Ticket-issuing admission control.
//!
//! An [`AdmissionEngine`] guards one logical endpoint. Callers request a
//! ticket, make their call once it is issued, and then either finish the
//! ticket or report an upstream rejection:
//!
//! - Tickets are issued from a FIFO queue whose head holds previously rejected
//!   (priority) work
//! - The issue rate ramps linearly from a floor up to the configured ceiling and
//!   never exceeds the ceiling over any rolling minute
//! - A reported rejection blocks the engine until the recovery prober sees the
//!   upstream accept requests again
//!
//! The driver spawned by [`AdmissionEngine::start_driver`] runs the clock and
//! the prober; tests can instead call [`AdmissionEngine::tick`] against a
//! [`ManualClock`].

mod budget;
mod clock;
mod counters;
mod driver;
mod engine;
mod guard;
mod queue;
mod service;
mod ticket;
mod window;

// Re-export public API
pub use clock::{Clock, ManualClock, TokioClock};
pub use counters::{EventCounts, EventKind};
pub use driver::DriverHandle;
pub use engine::{AdmissionEngine, BlockState, EngineSnapshot, TicketWaiter};
pub use guard::{call_limited, call_limited_default, TicketGuard, UpstreamRejection};
pub use service::{DefaultRateLimitedService, RateLimitedService};
pub use ticket::{Ticket, TicketId, TicketOutcome, TicketRecord};
