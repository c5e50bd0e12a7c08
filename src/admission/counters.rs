//! Per-engine event counters.
//!
//! Counters only ever grow; the monitor turns them into per-interval counts by
//! subtracting the previous snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter as EnumIterMacro;

/// Kinds of events counted per engine and written to the session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIterMacro)]
pub enum EventKind {
    /// A caller asked for a ticket
    Requested,
    /// A ticket was issued
    Issued,
    /// A caller reported an upstream rejection
    Exception,
    /// A caller finished a ticket
    Finished,
    /// A request was refused because the queue was full
    Overflow,
    /// A caller gave up waiting, or dropped an issued ticket
    Abandoned,
}

impl EventKind {
    /// Lowercase name, as used for table headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Requested => "requested",
            EventKind::Issued => "issued",
            EventKind::Exception => "exception",
            EventKind::Finished => "finished",
            EventKind::Overflow => "overflow",
            EventKind::Abandoned => "abandoned",
        }
    }

    /// Single-letter line code used by the log inspection CLI.
    pub fn code(&self) -> char {
        match self {
            EventKind::Requested => 'r',
            EventKind::Issued => 'i',
            EventKind::Exception => 'e',
            EventKind::Finished => 'f',
            EventKind::Overflow => 'o',
            EventKind::Abandoned => 'a',
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: char) -> Option<Self> {
        EventKind::iter().find(|kind| kind.code() == code)
    }
}

/// Plain counts per event kind, as stored in log events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    /// Requests submitted, including ones that overflowed
    pub requested: u64,
    /// Tickets issued
    pub issued: u64,
    /// Tickets reported as rejected upstream
    pub exception: u64,
    /// Tickets finished normally
    pub finished: u64,
    /// Requests refused by the queue bound
    pub overflow: u64,
    /// Requests or tickets given up by their caller
    #[serde(default)]
    pub abandoned: u64,
}

impl EventCounts {
    /// Count for one kind.
    pub fn get(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::Requested => self.requested,
            EventKind::Issued => self.issued,
            EventKind::Exception => self.exception,
            EventKind::Finished => self.finished,
            EventKind::Overflow => self.overflow,
            EventKind::Abandoned => self.abandoned,
        }
    }

    fn slot(&mut self, kind: EventKind) -> &mut u64 {
        match kind {
            EventKind::Requested => &mut self.requested,
            EventKind::Issued => &mut self.issued,
            EventKind::Exception => &mut self.exception,
            EventKind::Finished => &mut self.finished,
            EventKind::Overflow => &mut self.overflow,
            EventKind::Abandoned => &mut self.abandoned,
        }
    }

    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &EventCounts) -> EventCounts {
        let mut delta = EventCounts::default();
        for kind in EventKind::iter() {
            *delta.slot(kind) = self.get(kind).saturating_sub(earlier.get(kind));
        }
        delta
    }

    /// True when nothing was counted.
    pub fn is_zero(&self) -> bool {
        EventKind::iter().all(|kind| self.get(kind) == 0)
    }
}

/// Thread-safe counters, one per [`EventKind`].
///
/// All kinds are initialized to zero on creation, so lookups never miss.
#[derive(Debug)]
pub(crate) struct EngineCounters {
    counts: HashMap<EventKind, AtomicU64>,
}

impl EngineCounters {
    pub(crate) fn new() -> Self {
        let mut counts = HashMap::new();
        for kind in EventKind::iter() {
            counts.insert(kind, AtomicU64::new(0));
        }
        EngineCounters { counts }
    }

    pub(crate) fn increment(&self, kind: EventKind) {
        self.add(kind, 1);
    }

    pub(crate) fn add(&self, kind: EventKind, n: u64) {
        if let Some(counter) = self.counts.get(&kind) {
            counter.fetch_add(n, Ordering::Relaxed);
        } else {
            log::error!(
                "Event counter for {:?} missing; EngineCounters was not fully initialized",
                kind
            );
        }
    }

    pub(crate) fn get(&self, kind: EventKind) -> u64 {
        self.counts
            .get(&kind)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub(crate) fn snapshot(&self) -> EventCounts {
        let mut counts = EventCounts::default();
        for kind in EventKind::iter() {
            *counts.slot(kind) = self.get(kind);
        }
        counts
    }
}
