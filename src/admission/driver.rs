//! Background loops that keep an engine moving.
//!
//! The ticker calls `tick()` on a fixed interval so queued requests are issued
//! without any caller polling. The prober sleeps until the engine is blocked,
//! then asks the attached service whether the upstream has recovered.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::engine::{AdmissionEngine, BlockState};
use crate::error_handling::MonitorError;

/// Join handles of an engine's ticker and prober.
///
/// Both loops exit when the engine shuts down.
#[derive(Debug)]
pub struct DriverHandle {
    ticker: JoinHandle<()>,
    prober: JoinHandle<()>,
}

impl DriverHandle {
    /// Waits for both loops to exit.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::TaskJoin`] if either loop panicked.
    pub async fn join(self) -> Result<(), MonitorError> {
        let (ticker, prober) = tokio::join!(self.ticker, self.prober);
        ticker?;
        prober?;
        Ok(())
    }

    /// Aborts both loops without waiting.
    pub fn abort(&self) {
        self.ticker.abort();
        self.prober.abort();
    }
}

impl AdmissionEngine {
    /// Spawns the ticker and prober for this engine on the current runtime.
    ///
    /// Call [`shutdown`](AdmissionEngine::shutdown) to stop them, then
    /// [`DriverHandle::join`] to wait for them.
    pub fn start_driver(&self) -> DriverHandle {
        DriverHandle {
            ticker: tokio::spawn(run_ticker(self.clone())),
            prober: tokio::spawn(run_prober(self.clone())),
        }
    }
}

async fn run_ticker(engine: AdmissionEngine) {
    let shutdown = engine.shared.shutdown.clone();
    let mut ticker = interval(engine.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.tick();
            }
            _ = shutdown.cancelled() => {
                log::debug!("[{}] ticker stopped", engine.name());
                break;
            }
        }
    }
}

async fn run_prober(engine: AdmissionEngine) {
    let shutdown = engine.shared.shutdown.clone();
    loop {
        if engine.block_state() != BlockState::Blocked {
            tokio::select! {
                _ = engine.shared.blocked.notified() => continue,
                _ = shutdown.cancelled() => break,
            }
        }
        tokio::select! {
            _ = probe_until_clear(&engine) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    log::debug!("[{}] prober stopped", engine.name());
}

/// Probes with backoff until the engine leaves the blocked state.
async fn probe_until_clear(engine: &AdmissionEngine) {
    let probe = engine.config().probe.clone();
    let mut delay: Duration = probe.min_interval;
    while engine.block_state() == BlockState::Blocked {
        tokio::time::sleep(delay).await;
        match engine.probe().await {
            Ok(false) => {
                engine.mark_recovering();
                return;
            }
            Ok(true) => {
                delay = probe.next_interval(delay);
                log::debug!(
                    "[{}] upstream still blocked, next probe in {:?}",
                    engine.name(),
                    delay
                );
            }
            Err(e) => {
                delay = probe.next_interval(delay);
                log::warn!(
                    "[{}] {}, next probe in {:?}",
                    engine.name(),
                    e,
                    delay
                );
            }
        }
    }
}
