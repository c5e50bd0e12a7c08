//! Tickets: permits to make one rate-limited call.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error_handling::TicketError;

/// Identifier of a ticket, unique within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TicketId(pub u64);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Terminal outcome of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketOutcome {
    /// The call completed (successfully or with a non-rate-limit failure).
    Finished,
    /// The upstream rejected the call.
    Exception,
    /// The ticket was issued but the caller dropped it unused.
    Abandoned,
}

/// An issued admission permit.
///
/// Tickets are not `Clone`: handing one back to the engine through
/// [`finish`](crate::AdmissionEngine::finish) or
/// [`report_exception`](crate::AdmissionEngine::report_exception) consumes it,
/// so the close transition happens once per ticket.
#[derive(Debug, PartialEq)]
pub struct Ticket {
    id: TicketId,
    caller: Arc<str>,
    priority: bool,
    requested_at: Instant,
    issued_at: Option<Instant>,
    outcome: Option<TicketOutcome>,
}

impl Ticket {
    pub(crate) fn pending(id: TicketId, caller: Arc<str>, priority: bool, now: Instant) -> Self {
        Ticket {
            id,
            caller,
            priority,
            requested_at: now,
            issued_at: None,
            outcome: None,
        }
    }

    /// Engine-unique id.
    pub fn id(&self) -> TicketId {
        self.id
    }

    /// Correlation tag supplied by the requester.
    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// True when the ticket was re-issued after an upstream rejection.
    pub fn is_priority(&self) -> bool {
        self.priority
    }

    /// When the request was submitted.
    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    /// When the ticket was issued, if it was.
    pub fn issued_at(&self) -> Option<Instant> {
        self.issued_at
    }

    /// Terminal outcome once closed.
    pub fn outcome(&self) -> Option<TicketOutcome> {
        self.outcome
    }

    pub(crate) fn caller_tag(&self) -> Arc<str> {
        Arc::clone(&self.caller)
    }

    pub(crate) fn mark_issued(&mut self, now: Instant) {
        self.issued_at = Some(now);
    }

    /// Sets the terminal outcome. Only the first call succeeds.
    pub(crate) fn close(&mut self, outcome: TicketOutcome) -> Result<(), TicketError> {
        if self.outcome.is_some() {
            return Err(TicketError::AlreadyClosed(self.id));
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    pub(crate) fn into_record(self) -> TicketRecord {
        TicketRecord {
            id: self.id,
            caller: self.caller,
            priority: self.priority,
            requested_at: self.requested_at,
            issued_at: self.issued_at,
            outcome: self.outcome,
        }
    }
}

/// Read-only view of a closed ticket, returned by `finish`.
#[derive(Debug, Clone)]
pub struct TicketRecord {
    /// Engine-unique id
    pub id: TicketId,
    /// Correlation tag supplied by the requester
    pub caller: Arc<str>,
    /// Re-issued after an upstream rejection
    pub priority: bool,
    /// When the request was submitted
    pub requested_at: Instant,
    /// When the ticket was issued
    pub issued_at: Option<Instant>,
    /// How the ticket was closed
    pub outcome: Option<TicketOutcome>,
}

impl TicketRecord {
    /// Time spent between the request and the issue.
    pub fn wait_time(&self) -> Option<std::time::Duration> {
        self.issued_at
            .map(|issued| issued.saturating_duration_since(self.requested_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> Ticket {
        Ticket::pending(TicketId(1), Arc::from("caller-a"), false, Instant::now())
    }

    #[test]
    fn test_new_ticket_is_pending() {
        let t = ticket();
        assert_eq!(t.id(), TicketId(1));
        assert_eq!(t.caller(), "caller-a");
        assert!(!t.is_priority());
        assert!(t.issued_at().is_none());
        assert!(t.outcome().is_none());
    }

    #[test]
    fn test_close_sets_outcome_once() {
        let mut t = ticket();
        assert!(t.close(TicketOutcome::Finished).is_ok());
        assert_eq!(t.outcome(), Some(TicketOutcome::Finished));

        let second = t.close(TicketOutcome::Exception);
        assert_eq!(second, Err(TicketError::AlreadyClosed(TicketId(1))));
        assert_eq!(t.outcome(), Some(TicketOutcome::Finished));
    }

    #[test]
    fn test_record_wait_time() {
        let start = Instant::now();
        let mut t = Ticket::pending(TicketId(2), Arc::from("c"), true, start);
        t.mark_issued(start + std::time::Duration::from_millis(1500));
        t.close(TicketOutcome::Finished).unwrap();

        let record = t.into_record();
        assert!(record.priority);
        assert_eq!(
            record.wait_time(),
            Some(std::time::Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_ticket_id_display() {
        assert_eq!(TicketId(42).to_string(), "#42");
    }
}
