//! Sampling loop: the only writer of the session log.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::event::{EngineKey, EventListener, LogEvent};
use super::writer::SessionLog;
use super::MonitorShared;
use crate::admission::{BlockState, EventCounts};

/// Samples every engine each `sample_interval` until cancelled, then takes
/// one final sample so counts up to shutdown reach the log.
pub(crate) async fn run_sampler(shared: Arc<MonitorShared>, mut log: SessionLog) {
    let period = shared.config.sample_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous: HashMap<EngineKey, EventCounts> = HashMap::new();
    let mut active: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sample_once(&shared, &mut log, &mut previous, &mut active);
            }
            _ = shared.cancel.cancelled() => {
                sample_once(&shared, &mut log, &mut previous, &mut active);
                break;
            }
        }
    }
    log::debug!("Sampler stopped, session log at {}", log.path().display());
}

/// Emits one event per engine that has ever been active.
///
/// An engine becomes active on its first interval with counts, a backlog or a
/// non-open state, and is logged every interval after that so its series has
/// no gaps.
fn sample_once(
    shared: &MonitorShared,
    log: &mut SessionLog,
    previous: &mut HashMap<EngineKey, EventCounts>,
    active: &mut HashSet<String>,
) -> usize {
    let (engines, listeners) = shared.sampling_view();
    let timestamp = Utc::now();
    let mut seen = HashSet::new();
    let mut events = Vec::new();

    for (key, engine) in engines {
        // An engine shared by several keys is logged once, under its first key
        if !seen.insert(engine.name().to_string()) {
            continue;
        }
        let snapshot = engine.snapshot();
        let last = previous.entry(key.clone()).or_default();
        let delta = snapshot.counts.since(last);
        *last = snapshot.counts;

        let busy = !delta.is_zero()
            || snapshot.queue_length > 0
            || snapshot.block_state != BlockState::Open;
        if busy {
            active.insert(snapshot.name.clone());
        } else if !active.contains(&snapshot.name) {
            continue;
        }
        events.push(LogEvent::from_snapshot(timestamp, &key, &snapshot, delta));
    }

    for listener in &listeners {
        notify(listener.as_ref(), &events);
    }
    log.append(&events)
}

/// Hands events to one listener; a panicking listener is logged and skipped.
fn notify(listener: &dyn EventListener, events: &[LogEvent]) {
    for event in events {
        if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
            log::warn!(
                "Event listener panicked on {} event, skipping it",
                event.engine_name()
            );
        }
    }
}
