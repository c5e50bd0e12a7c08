//! Capacity budget: linear ramp plus fractional per-tick allowance.

use std::time::Duration;

use tokio::time::Instant;

use super::window::IssueWindow;
use crate::config::{EngineConfig, RAMP_FLOOR_FRACTION, RATE_WINDOW};

/// How many tickets the engine may issue right now.
///
/// `current_rate` (requests per minute) climbs linearly from `floor` to
/// `rate_limit` over the ramp duration while there is demand. Every advance adds
/// `current_rate / 60 * elapsed_secs` to a fractional allowance; whole units are
/// issued and the remainder carries to the next tick. The allowance is capped at
/// one tick's allotment (or one ticket, whichever is larger) so idle time never
/// turns into a burst. The issue window enforces the hard ceiling of
/// `rate_limit` issues per rolling minute.
#[derive(Debug)]
pub(crate) struct CapacityBudget {
    rate_limit: f64,
    floor: f64,
    current_rate: f64,
    /// Requests-per-minute added per second of ramp
    ramp_step: f64,
    allowance: f64,
    tick_interval: Duration,
    idle_reset: Duration,
    last_advance: Instant,
    last_demand: Instant,
    window: IssueWindow,
}

impl CapacityBudget {
    pub(crate) fn new(config: &EngineConfig, now: Instant) -> Self {
        let rate_limit = f64::from(config.rate_limit);
        let floor = (rate_limit * RAMP_FLOOR_FRACTION).max(1.0).min(rate_limit);
        let ramp_secs = config.ramp_duration.as_secs_f64();
        let ramp_step = if ramp_secs > 0.0 {
            (rate_limit - floor) / ramp_secs
        } else {
            f64::INFINITY
        };

        CapacityBudget {
            rate_limit,
            floor,
            current_rate: floor,
            ramp_step,
            // A fresh engine admits its first request without waiting
            allowance: 1.0,
            tick_interval: config.tick_interval,
            idle_reset: config.idle_reset,
            last_advance: now,
            last_demand: now,
            window: IssueWindow::new(config.rate_limit as usize, RATE_WINDOW),
        }
    }

    pub(crate) fn rate_limit(&self) -> f64 {
        self.rate_limit
    }

    #[cfg(test)]
    pub(crate) fn floor(&self) -> f64 {
        self.floor
    }

    pub(crate) fn current_rate(&self) -> f64 {
        self.current_rate
    }

    pub(crate) fn is_ramped(&self) -> bool {
        self.current_rate >= self.rate_limit
    }

    /// Largest allowance carried between ticks.
    fn allowance_cap(&self) -> f64 {
        let per_tick = self.current_rate / 60.0 * self.tick_interval.as_secs_f64();
        per_tick.max(1.0)
    }

    /// Brings ramp and allowance up to `now`.
    ///
    /// `has_demand` is true when tickets are waiting or arriving; without demand
    /// the ramp holds, and after `idle_reset` it falls back to the floor.
    pub(crate) fn advance(&mut self, now: Instant, has_demand: bool) {
        let elapsed = now.saturating_duration_since(self.last_advance);
        self.last_advance = now;

        if has_demand {
            self.last_demand = now;
            if self.current_rate < self.rate_limit {
                let step = self.ramp_step * elapsed.as_secs_f64();
                self.current_rate = (self.current_rate + step).min(self.rate_limit);
            }
        } else if self.current_rate > self.floor
            && now.saturating_duration_since(self.last_demand) >= self.idle_reset
        {
            log::debug!(
                "Idle for {:?}, ramp restarts at {:.1} rpm",
                self.idle_reset,
                self.floor
            );
            self.current_rate = self.floor;
        }

        self.allowance += self.current_rate / 60.0 * elapsed.as_secs_f64();
        self.allowance = self.allowance.min(self.allowance_cap());
    }

    /// Freezes the budget while blocked: time passes but nothing accrues.
    pub(crate) fn hold(&mut self, now: Instant) {
        self.last_advance = now;
        self.allowance = 0.0;
    }

    /// Drops back to the floor with no carried allowance.
    pub(crate) fn restart_ramp(&mut self) {
        self.current_rate = self.floor;
        self.allowance = 0.0;
    }

    /// Whole tickets that may be issued at `now`.
    pub(crate) fn available(&mut self, now: Instant) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = self.allowance.floor().max(0.0) as usize;
        whole.min(self.window.remaining(now))
    }

    /// Charges one issued ticket.
    pub(crate) fn consume(&mut self, now: Instant) {
        self.allowance -= 1.0;
        self.window.record(now);
    }

    pub(crate) fn issued_in_window(&mut self, now: Instant) -> usize {
        self.window.count(now)
    }
}
