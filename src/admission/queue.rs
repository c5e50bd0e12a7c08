//! Ordered waiting list of ticket requests.

use std::collections::VecDeque;

use super::ticket::TicketId;

/// One waiting request.
#[derive(Debug)]
pub(crate) struct Pending<T> {
    pub(crate) id: TicketId,
    pub(crate) priority: bool,
    pub(crate) payload: T,
}

/// FIFO queue with a priority segment at the head.
///
/// The deque holds `priority_len` priority entries followed by the normal
/// entries. Priority inserts go to the end of the priority segment, so
/// previously-rejected work drains first and each class stays in arrival order.
/// Not synchronized: the engine mutates it under its own lock.
#[derive(Debug)]
pub(crate) struct TicketQueue<T> {
    entries: VecDeque<Pending<T>>,
    priority_len: usize,
}

impl<T> TicketQueue<T> {
    pub(crate) fn new() -> Self {
        TicketQueue {
            entries: VecDeque::new(),
            priority_len: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, id: TicketId, priority: bool, payload: T) {
        let entry = Pending {
            id,
            priority,
            payload,
        };
        if priority {
            self.entries.insert(self.priority_len, entry);
            self.priority_len += 1;
        } else {
            self.entries.push_back(entry);
        }
    }

    /// Removes up to `n` entries from the head.
    pub(crate) fn dequeue_if_capacity(&mut self, n: usize) -> Vec<Pending<T>> {
        let take = n.min(self.entries.len());
        let drained: Vec<_> = self.entries.drain(..take).collect();
        self.priority_len -= drained.iter().filter(|p| p.priority).count();
        drained
    }

    pub(crate) fn peek_length(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn priority_length(&self) -> usize {
        self.priority_len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the entry with `id`, wherever it sits.
    pub(crate) fn remove(&mut self, id: TicketId) -> Option<Pending<T>> {
        let index = self.entries.iter().position(|p| p.id == id)?;
        let removed = self.entries.remove(index)?;
        if removed.priority {
            self.priority_len -= 1;
        }
        Some(removed)
    }

    pub(crate) fn drain_all(&mut self) -> Vec<Pending<T>> {
        self.priority_len = 0;
        self.entries.drain(..).collect()
    }
}

impl<T> Default for TicketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
