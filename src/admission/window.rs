//! Sliding window of issue times.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Remembers when tickets were issued within the last `window_duration`.
///
/// The budget consults it before every issue so that no rolling window ever
/// holds more than `limit` tickets, whatever the ramp or allowance says.
#[derive(Debug)]
pub(crate) struct IssueWindow {
    issued: VecDeque<Instant>,
    limit: usize,
    window_duration: Duration,
}

impl IssueWindow {
    pub(crate) fn new(limit: usize, window_duration: Duration) -> Self {
        IssueWindow {
            issued: VecDeque::with_capacity(limit.min(4096)),
            limit,
            window_duration,
        }
    }

    fn expire(&mut self, now: Instant) {
        // Remove old entries outside the time window
        while let Some(front) = self.issued.front() {
            if now.saturating_duration_since(*front) >= self.window_duration {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records one issue at `now`.
    pub(crate) fn record(&mut self, now: Instant) {
        self.expire(now);
        self.issued.push_back(now);
    }

    /// Issues still allowed in the window ending at `now`.
    pub(crate) fn remaining(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.limit.saturating_sub(self.issued.len())
    }

    /// Issues recorded in the window ending at `now`.
    pub(crate) fn count(&mut self, now: Instant) -> usize {
        self.expire(now);
        self.issued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_window_empty() {
        let mut window = IssueWindow::new(5, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(window.count(now), 0);
        assert_eq!(window.remaining(now), 5);
    }

    #[test]
    fn test_issue_window_counts_down() {
        let mut window = IssueWindow::new(3, Duration::from_secs(60));
        let now = Instant::now();
        window.record(now);
        window.record(now);
        assert_eq!(window.remaining(now), 1);
        window.record(now);
        assert_eq!(window.remaining(now), 0);
    }

    #[test]
    fn test_issue_window_time_expiration() {
        let mut window = IssueWindow::new(2, Duration::from_secs(60));
        let start = Instant::now();
        window.record(start);
        window.record(start + Duration::from_secs(30));
        assert_eq!(window.remaining(start + Duration::from_secs(59)), 0);

        // First entry leaves the window exactly 60s after it was recorded
        assert_eq!(window.remaining(start + Duration::from_secs(60)), 1);
        assert_eq!(window.count(start + Duration::from_secs(90)), 0);
    }

    #[test]
    fn test_issue_window_partial_expiration() {
        let mut window = IssueWindow::new(10, Duration::from_millis(100));
        let start = Instant::now();
        window.record(start);
        window.record(start);
        window.record(start + Duration::from_millis(50));
        window.record(start + Duration::from_millis(60));

        assert_eq!(window.count(start + Duration::from_millis(99)), 4);
        assert_eq!(window.count(start + Duration::from_millis(110)), 2);
    }
}
