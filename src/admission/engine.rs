//! Admission engine: issues tickets under the capacity budget.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::budget::CapacityBudget;
use super::clock::{Clock, TokioClock};
use super::counters::{EngineCounters, EventCounts, EventKind};
use super::guard::TicketGuard;
use super::queue::TicketQueue;
use super::service::RateLimitedService;
use super::ticket::{Ticket, TicketId, TicketOutcome, TicketRecord};
use crate::config::EngineConfig;
use crate::error_handling::{AdmissionError, ConfigError, ProbeError, TicketError};

/// Upstream health as inferred from exceptions and probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Issuing normally.
    Open,
    /// An upstream rejection was reported; nothing is issued until a probe clears it.
    Blocked,
    /// A probe cleared the block; the ramp restarts and priority tickets drain first.
    Recovering,
}

impl BlockState {
    /// Name as written to session logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Open => "open",
            BlockState::Blocked => "blocked",
            BlockState::Recovering => "recovering",
        }
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of an engine, taken under a short lock.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    /// Engine name, `service` or `service/model`
    pub name: String,
    /// Current block state
    pub block_state: BlockState,
    /// Configured ceiling in requests per minute
    pub rate_limit: f64,
    /// Ramped rate in requests per minute
    pub current_rate: f64,
    /// Waiting tickets, priority included
    pub queue_length: usize,
    /// Waiting priority tickets
    pub priority_length: usize,
    /// Issued tickets not yet finished or reported
    pub outstanding: usize,
    /// Tickets issued in the last rolling minute
    pub issued_last_minute: usize,
    /// Totals since the engine was created
    pub counts: EventCounts,
}

type Delivery = Result<Ticket, AdmissionError>;

#[derive(Debug)]
struct Waiting {
    ticket: Ticket,
    responder: oneshot::Sender<Delivery>,
}

struct EngineState {
    queue: TicketQueue<Waiting>,
    budget: CapacityBudget,
    block_state: BlockState,
    outstanding: HashSet<TicketId>,
    shutting_down: bool,
}

pub(crate) struct EngineShared {
    name: String,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    counters: EngineCounters,
    next_id: AtomicU64,
    pub(crate) blocked: Notify,
    pub(crate) shutdown: CancellationToken,
    service: Mutex<Option<Weak<dyn RateLimitedService>>>,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancellation path of a dropped [`TicketWaiter`].
    fn abandon(&self, id: TicketId, rx: &mut oneshot::Receiver<Delivery>) {
        let mut state = self.lock();
        if state.queue.remove(id).is_some() {
            self.counters.increment(EventKind::Abandoned);
            log::debug!("[{}] ticket {} abandoned while waiting", self.name, id);
            return;
        }
        // Deliveries are sent under the lock, so anything issued is already in the channel
        if let Ok(Ok(ticket)) = rx.try_recv() {
            self.abandon_issued(&mut state, ticket);
        }
    }

    /// Closes an issued ticket nobody collected.
    fn abandon_issued(&self, state: &mut EngineState, mut ticket: Ticket) {
        if state.outstanding.remove(&ticket.id()) {
            let _ = ticket.close(TicketOutcome::Abandoned);
            self.counters.increment(EventKind::Abandoned);
            log::debug!("[{}] ticket {} dropped right after issue", self.name, ticket.id());
        }
    }
}

/// Ticket-issuing rate limiter for one logical endpoint.
///
/// Cloning is cheap and every clone drives the same engine. All mutations of the
/// queue, budget and block state go through one mutex, so `tick`,
/// `request_ticket`, `finish` and `report_exception` are linearized per engine;
/// different engines share nothing.
///
/// # Examples
///
/// ```no_run
/// use ratellmiter::{AdmissionEngine, EngineConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = AdmissionEngine::new("openai", EngineConfig::with_rate_limit(600))?;
/// let driver = engine.start_driver();
///
/// let ticket = engine.request_ticket("job-1", false).await?;
/// // ... call the API ...
/// engine.finish(ticket)?;
///
/// engine.shutdown();
/// driver.join().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AdmissionEngine {
    pub(crate) shared: Arc<EngineShared>,
}

impl fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionEngine")
            .field("name", &self.shared.name)
            .field("rate_limit", &self.shared.config.rate_limit)
            .finish()
    }
}

impl AdmissionEngine {
    /// Creates an engine driven by tokio's clock.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails validation.
    pub fn new(name: impl Into<String>, config: EngineConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, Arc::new(TokioClock))
    }

    /// Creates an engine that reads time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails validation.
    pub fn with_clock(
        name: impl Into<String>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = clock.now();
        let state = EngineState {
            queue: TicketQueue::new(),
            budget: CapacityBudget::new(&config, now),
            block_state: BlockState::Open,
            outstanding: HashSet::new(),
            shutting_down: false,
        };
        Ok(AdmissionEngine {
            shared: Arc::new(EngineShared {
                name: name.into(),
                config,
                clock,
                state: Mutex::new(state),
                counters: EngineCounters::new(),
                next_id: AtomicU64::new(0),
                blocked: Notify::new(),
                shutdown: CancellationToken::new(),
                service: Mutex::new(None),
            }),
        })
    }

    /// Engine name (`service` or `service/model`).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn next_id(&self) -> TicketId {
        TicketId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Attaches the service whose `is_blocked` probe clears blocks.
    ///
    /// Only the first live service sticks, so one engine can be shared by a
    /// service that serves several models. Returns `true` if attached.
    pub fn attach_service(&self, service: &Arc<dyn RateLimitedService>) -> bool {
        let mut slot = self
            .shared
            .service
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().and_then(Weak::upgrade).is_some() {
            return false;
        }
        *slot = Some(Arc::downgrade(service));
        true
    }

    /// Asks the attached service whether the upstream still blocks us.
    ///
    /// Without a live service the upstream is assumed to have recovered.
    pub(crate) async fn probe(&self) -> Result<bool, ProbeError> {
        let service = {
            let slot = self
                .shared
                .service
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.as_ref().and_then(Weak::upgrade)
        };
        match service {
            Some(service) => service.is_blocked().await,
            None => Ok(false),
        }
    }

    /// Enqueues a request without waiting for it.
    ///
    /// The returned [`TicketWaiter`] resolves when the ticket is issued; dropping
    /// it cancels the request and counts it as abandoned. When the engine is open,
    /// the queue is empty and the budget has a whole ticket, the waiter is
    /// already resolved.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::Overflow`] if a non-priority request that cannot be
    ///   issued at once finds `queue_bound` non-priority tickets waiting
    /// - [`AdmissionError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    pub fn submit(
        &self,
        caller: impl Into<Arc<str>>,
        priority: bool,
    ) -> Result<TicketWaiter, AdmissionError> {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();
        if state.shutting_down {
            return Err(AdmissionError::ShuttingDown);
        }
        self.shared.counters.increment(EventKind::Requested);

        let id = self.next_id();
        let mut ticket = Ticket::pending(id, caller.into(), priority, now);

        if state.block_state == BlockState::Open && state.queue.is_empty() {
            state.budget.advance(now, true);
            if state.budget.available(now) > 0 {
                state.budget.consume(now);
                ticket.mark_issued(now);
                state.outstanding.insert(id);
                self.shared.counters.increment(EventKind::Issued);
                return Ok(TicketWaiter::ready(
                    id,
                    Ok(ticket),
                    Arc::downgrade(&self.shared),
                ));
            }
        }

        // Only requests that would wait count against the bound
        if !priority {
            if let Some(bound) = self.shared.config.queue_bound {
                let waiting = state.queue.peek_length() - state.queue.priority_length();
                if waiting >= bound {
                    self.shared.counters.increment(EventKind::Overflow);
                    log::debug!(
                        "[{}] overflow: {} waiting, bound {}",
                        self.shared.name,
                        waiting,
                        bound
                    );
                    return Err(AdmissionError::Overflow {
                        queue_length: state.queue.peek_length(),
                        bound,
                    });
                }
            }
        }

        Ok(self.enqueue_locked(&mut state, ticket))
    }

    fn enqueue_locked(&self, state: &mut EngineState, ticket: Ticket) -> TicketWaiter {
        let id = ticket.id();
        let priority = ticket.is_priority();
        let (responder, rx) = oneshot::channel();
        state
            .queue
            .enqueue(id, priority, Waiting { ticket, responder });
        TicketWaiter::waiting(id, rx, Arc::downgrade(&self.shared))
    }

    /// Waits until a ticket is issued.
    ///
    /// Suspends the task (no polling) until the engine's clock drains this
    /// request. Cancelling the returned future removes the request from the queue.
    ///
    /// # Errors
    ///
    /// See [`submit`](Self::submit); a shutdown while waiting also yields
    /// [`AdmissionError::ShuttingDown`].
    pub async fn request_ticket(
        &self,
        caller: impl Into<Arc<str>>,
        priority: bool,
    ) -> Result<Ticket, AdmissionError> {
        self.submit(caller, priority)?.await
    }

    /// Like [`request_ticket`](Self::request_ticket) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::Abandoned`] when the timeout elapses first.
    pub async fn request_ticket_timeout(
        &self,
        caller: impl Into<Arc<str>>,
        priority: bool,
        timeout: Duration,
    ) -> Result<Ticket, AdmissionError> {
        let waiter = self.submit(caller, priority)?;
        match tokio::time::timeout(timeout, waiter).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::Abandoned),
        }
    }

    /// Requests a ticket wrapped in a guard that finishes it on drop.
    ///
    /// # Errors
    ///
    /// Same as [`request_ticket`](Self::request_ticket).
    pub async fn acquire(&self, caller: impl Into<Arc<str>>) -> Result<TicketGuard, AdmissionError> {
        let ticket = self.request_ticket(caller, false).await?;
        Ok(TicketGuard::new(self.clone(), ticket))
    }

    /// Closes a ticket whose call completed.
    ///
    /// Capacity is time-based, so nothing is returned to the budget; only the
    /// outstanding count changes.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotOutstanding`] if this engine did not issue the ticket
    /// or already closed it.
    pub fn finish(&self, mut ticket: Ticket) -> Result<TicketRecord, TicketError> {
        {
            let mut state = self.shared.lock();
            if !state.outstanding.remove(&ticket.id()) {
                return Err(TicketError::NotOutstanding(ticket.id()));
            }
        }
        ticket.close(TicketOutcome::Finished)?;
        self.shared.counters.increment(EventKind::Finished);
        Ok(ticket.into_record())
    }

    /// Closes a ticket whose call was rejected upstream and re-queues the caller.
    ///
    /// The engine becomes [`BlockState::Blocked`] (if it was not already), the
    /// ramp restarts from the floor, and the prober is woken. A fresh priority
    /// ticket for the same caller goes to the head of the queue; await the
    /// returned waiter to retry.
    ///
    /// # Errors
    ///
    /// [`TicketError::NotOutstanding`] if this engine did not issue the ticket
    /// or already closed it.
    pub fn report_exception(&self, mut ticket: Ticket) -> Result<TicketWaiter, TicketError> {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();
        if !state.outstanding.remove(&ticket.id()) {
            return Err(TicketError::NotOutstanding(ticket.id()));
        }
        ticket.close(TicketOutcome::Exception)?;
        self.shared.counters.increment(EventKind::Exception);

        let newly_blocked = state.block_state != BlockState::Blocked;
        if newly_blocked {
            log::info!(
                "[{}] upstream rejected ticket {}, {} -> blocked",
                self.shared.name,
                ticket.id(),
                state.block_state
            );
            state.block_state = BlockState::Blocked;
            state.budget.restart_ramp();
            state.budget.hold(now);
        }

        let waiter = if state.shutting_down {
            TicketWaiter::ready(ticket.id(), Err(AdmissionError::ShuttingDown), Weak::new())
        } else {
            let retry = Ticket::pending(self.next_id(), ticket.caller_tag(), true, now);
            self.enqueue_locked(&mut state, retry)
        };
        drop(state);

        if newly_blocked {
            self.shared.blocked.notify_one();
        }
        Ok(waiter)
    }

    /// Issues as many tickets as the budget allows at the clock's current time.
    ///
    /// Called by the driver every `tick_interval`. Returns the number issued.
    pub fn tick(&self) -> usize {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();
        if state.shutting_down {
            return 0;
        }
        if state.block_state == BlockState::Blocked {
            state.budget.hold(now);
            return 0;
        }

        let has_demand = !state.queue.is_empty();
        state.budget.advance(now, has_demand);
        let allowed = state.budget.available(now);
        let drained = state.queue.dequeue_if_capacity(allowed);
        let issued = drained.len();

        for pending in drained {
            let Waiting {
                mut ticket,
                responder,
            } = pending.payload;
            ticket.mark_issued(now);
            state.budget.consume(now);
            state.outstanding.insert(pending.id);
            self.shared.counters.increment(EventKind::Issued);
            if let Err(Ok(mut orphan)) = responder.send(Ok(ticket)) {
                state.outstanding.remove(&pending.id);
                let _ = orphan.close(TicketOutcome::Abandoned);
                self.shared.counters.increment(EventKind::Abandoned);
            }
        }

        if state.block_state == BlockState::Recovering
            && state.queue.priority_length() == 0
            && (state.budget.is_ramped() || state.queue.is_empty())
        {
            log::info!(
                "[{}] recovery complete at {:.1} rpm, recovering -> open",
                self.shared.name,
                state.budget.current_rate()
            );
            state.block_state = BlockState::Open;
        }

        if issued > 0 {
            log::trace!(
                "[{}] issued {} ticket(s) at {:.1} rpm, {} waiting",
                self.shared.name,
                issued,
                state.budget.current_rate(),
                state.queue.peek_length()
            );
        }
        issued
    }

    /// Moves a blocked engine to [`BlockState::Recovering`].
    ///
    /// Only the prober calls this. Returns `false` if the engine was not blocked.
    pub(crate) fn mark_recovering(&self) -> bool {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();
        if state.block_state != BlockState::Blocked {
            return false;
        }
        state.block_state = BlockState::Recovering;
        state.budget.restart_ramp();
        state.budget.hold(now);
        log::info!(
            "[{}] probe reports upstream clear, blocked -> recovering ({} priority waiting)",
            self.shared.name,
            state.queue.priority_length()
        );
        true
    }

    /// Stops the engine: every waiter fails with [`AdmissionError::ShuttingDown`],
    /// new requests are refused and the driver loops exit.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.drain_all()
        };
        let failed = drained.len();
        for pending in drained {
            let _ = pending
                .payload
                .responder
                .send(Err(AdmissionError::ShuttingDown));
        }
        self.shared.shutdown.cancel();
        log::info!(
            "[{}] shut down, {} waiting request(s) failed",
            self.shared.name,
            failed
        );
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }

    /// Current block state.
    pub fn block_state(&self) -> BlockState {
        self.shared.lock().block_state
    }

    /// Ramped rate in requests per minute.
    pub fn current_rate(&self) -> f64 {
        self.shared.lock().budget.current_rate()
    }

    /// Event totals since creation.
    pub fn counts(&self) -> EventCounts {
        self.shared.counters.snapshot()
    }

    /// Consistent view of queue, budget and counts.
    pub fn snapshot(&self) -> EngineSnapshot {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock();
        let issued_last_minute = state.budget.issued_in_window(now);
        EngineSnapshot {
            name: self.shared.name.clone(),
            block_state: state.block_state,
            rate_limit: state.budget.rate_limit(),
            current_rate: state.budget.current_rate(),
            queue_length: state.queue.peek_length(),
            priority_length: state.queue.priority_length(),
            outstanding: state.outstanding.len(),
            issued_last_minute,
            counts: self.shared.counters.snapshot(),
        }
    }

    #[cfg(test)]
    pub(crate) fn now(&self) -> tokio::time::Instant {
        self.shared.clock.now()
    }
}

enum WaiterState {
    Ready {
        delivery: Option<Delivery>,
        engine: Weak<EngineShared>,
    },
    Waiting {
        rx: oneshot::Receiver<Delivery>,
        engine: Weak<EngineShared>,
    },
}

/// Future resolving to an issued ticket.
///
/// Dropping an unresolved waiter cancels the request: it leaves the queue
/// without being issued and is counted as abandoned.
pub struct TicketWaiter {
    id: TicketId,
    state: WaiterState,
}

impl TicketWaiter {
    fn ready(id: TicketId, delivery: Delivery, engine: Weak<EngineShared>) -> Self {
        TicketWaiter {
            id,
            state: WaiterState::Ready {
                delivery: Some(delivery),
                engine,
            },
        }
    }

    fn waiting(id: TicketId, rx: oneshot::Receiver<Delivery>, engine: Weak<EngineShared>) -> Self {
        TicketWaiter {
            id,
            state: WaiterState::Waiting { rx, engine },
        }
    }

    /// Id of the requested ticket.
    pub fn id(&self) -> TicketId {
        self.id
    }
}

impl fmt::Debug for TicketWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waiting = matches!(self.state, WaiterState::Waiting { .. });
        f.debug_struct("TicketWaiter")
            .field("id", &self.id)
            .field("waiting", &waiting)
            .finish()
    }
}

impl Future for TicketWaiter {
    type Output = Delivery;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let delivery = match &mut this.state {
            WaiterState::Ready { delivery, .. } => {
                delivery.take().unwrap_or(Err(AdmissionError::Abandoned))
            }
            WaiterState::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(delivery)) => delivery,
                // Sender dropped with the engine
                Poll::Ready(Err(_)) => Err(AdmissionError::ShuttingDown),
            },
        };
        this.state = WaiterState::Ready {
            delivery: None,
            engine: Weak::new(),
        };
        Poll::Ready(delivery)
    }
}

impl Drop for TicketWaiter {
    fn drop(&mut self) {
        match &mut self.state {
            WaiterState::Waiting { rx, engine } => {
                if let Some(engine) = engine.upgrade() {
                    engine.abandon(self.id, rx);
                }
            }
            // Issued at submit time but never polled
            WaiterState::Ready { delivery, engine } => {
                if let (Some(Ok(ticket)), Some(engine)) = (delivery.take(), engine.upgrade()) {
                    let mut state = engine.lock();
                    engine.abandon_issued(&mut state, ticket);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::clock::ManualClock;
    use futures::FutureExt;

    fn engine_with(config: EngineConfig) -> (AdmissionEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let engine = AdmissionEngine::with_clock("test", config, clock.clone())
            .expect("valid config");
        (engine, clock)
    }

    fn config(rate_limit: u32) -> EngineConfig {
        EngineConfig {
            rate_limit,
            tick_interval: Duration::from_millis(100),
            ramp_duration: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Takes the one immediate ticket a fresh engine hands out.
    fn spend_initial_allowance(engine: &AdmissionEngine) -> Ticket {
        engine
            .submit("warmup", false)
            .expect("submit")
            .now_or_never()
            .expect("first ticket is immediate")
            .expect("issued")
    }

    #[test]
    fn test_first_request_is_immediate() {
        let (engine, _clock) = engine_with(config(60));
        let ticket = spend_initial_allowance(&engine);
        assert!(ticket.issued_at().is_some());
        assert_eq!(engine.snapshot().outstanding, 1);
        assert_eq!(engine.counts().issued, 1);
    }

    #[test]
    fn test_second_request_waits_for_tick() {
        let (engine, clock) = engine_with(config(60));
        let _first = spend_initial_allowance(&engine);

        let mut waiter = engine.submit("b", false).unwrap();
        assert!((&mut waiter).now_or_never().is_none());
        assert_eq!(engine.snapshot().queue_length, 1);

        // Floor is 15 rpm, so the second ticket needs a few seconds of accrual
        let mut issued = 0;
        for _ in 0..40 {
            clock.advance(Duration::from_millis(100));
            issued += engine.tick();
        }
        assert_eq!(issued, 1);
        let ticket = waiter.now_or_never().expect("resolved").expect("issued");
        assert_eq!(ticket.caller(), "b");
    }

    #[test]
    fn test_finish_twice_is_rejected() {
        let (engine, _clock) = engine_with(config(60));
        let ticket = spend_initial_allowance(&engine);
        let id = ticket.id();
        let record = engine.finish(ticket).expect("finish");
        assert_eq!(record.outcome, Some(TicketOutcome::Finished));
        assert_eq!(engine.snapshot().outstanding, 0);

        // A ticket with the same id that the engine no longer tracks
        let forged = Ticket::pending(id, Arc::from("x"), false, engine.now());
        assert_eq!(
            engine.finish(forged).unwrap_err(),
            TicketError::NotOutstanding(id)
        );
    }

    #[test]
    fn test_report_exception_blocks_and_requeues_priority() {
        let (engine, clock) = engine_with(config(600));
        let ticket = spend_initial_allowance(&engine);
        let mut normal = engine.submit("normal", false).unwrap();

        let mut retry = engine.report_exception(ticket).expect("outstanding");
        assert_eq!(engine.block_state(), BlockState::Blocked);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.priority_length, 1);
        assert_eq!(snapshot.queue_length, 2);
        assert_eq!(snapshot.current_rate, 150.0);
        assert_eq!(snapshot.counts.exception, 1);

        for _ in 0..100 {
            clock.advance(Duration::from_millis(100));
            assert_eq!(engine.tick(), 0);
        }
        assert!((&mut retry).now_or_never().is_none());
        assert!((&mut normal).now_or_never().is_none());

        assert!(engine.mark_recovering());
        assert_eq!(engine.block_state(), BlockState::Recovering);

        let mut order = Vec::new();
        let mut retry = Some(retry);
        let mut normal = Some(normal);
        for _ in 0..100 {
            clock.advance(Duration::from_millis(100));
            engine.tick();
            if let Some(Ok(t)) = retry.as_mut().and_then(|w| w.now_or_never()) {
                order.push(t.is_priority());
                retry = None;
            }
            if let Some(Ok(t)) = normal.as_mut().and_then(|w| w.now_or_never()) {
                order.push(t.is_priority());
                normal = None;
            }
            if retry.is_none() && normal.is_none() {
                break;
            }
        }
        assert_eq!(order, vec![true, false]);
    }

    #[test]
    fn test_dropped_retry_is_abandoned() {
        let (engine, _clock) = engine_with(config(600));
        let first = spend_initial_allowance(&engine);
        let retry_first = engine.report_exception(first).unwrap();
        assert_eq!(engine.block_state(), BlockState::Blocked);
        assert_eq!(engine.snapshot().priority_length, 1);
        drop(retry_first);
        assert_eq!(engine.snapshot().priority_length, 0);
        assert_eq!(engine.counts().abandoned, 1);
    }

    #[test]
    fn test_overflow_is_immediate_and_priority_exempt() {
        let (engine, _clock) = engine_with(EngineConfig {
            queue_bound: Some(2),
            ..config(60)
        });
        let ticket = spend_initial_allowance(&engine);
        let _a = engine.submit("a", false).unwrap();
        let _b = engine.submit("b", false).unwrap();
        let err = engine.submit("c", false).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::Overflow {
                queue_length: 2,
                bound: 2
            }
        );
        assert_eq!(engine.counts().overflow, 1);

        // Priority re-queue is not bounded
        let _retry = engine.report_exception(ticket).unwrap();
        assert_eq!(engine.snapshot().queue_length, 3);
    }

    #[test]
    fn test_dropped_waiter_is_abandoned_not_issued() {
        let (engine, clock) = engine_with(config(60));
        let _first = spend_initial_allowance(&engine);
        let waiter = engine.submit("gives-up", false).unwrap();
        drop(waiter);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.queue_length, 0);
        assert_eq!(snapshot.counts.abandoned, 1);

        for _ in 0..100 {
            clock.advance(Duration::from_millis(100));
            engine.tick();
        }
        let counts = engine.counts();
        assert_eq!(counts.issued, 1);
        assert_eq!(counts.overflow, 0);
    }

    #[test]
    fn test_dropped_waiter_after_issue_is_abandoned() {
        let (engine, clock) = engine_with(config(60));
        let _first = spend_initial_allowance(&engine);
        let waiter = engine.submit("late", false).unwrap();
        while engine.tick() == 0 {
            clock.advance(Duration::from_millis(100));
        }
        assert_eq!(engine.snapshot().outstanding, 2);

        drop(waiter);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.outstanding, 1);
        assert_eq!(snapshot.counts.abandoned, 1);
    }

    #[test]
    fn test_recovery_ramps_monotonically_within_per_tick_allotment() {
        let (engine, clock) = engine_with(EngineConfig {
            queue_bound: None,
            ..config(1200)
        });
        let first = spend_initial_allowance(&engine);
        let _retry = engine.report_exception(first).unwrap();
        let _backlog: Vec<_> = (0..300)
            .map(|i| engine.submit(format!("backlog-{i}"), false).unwrap())
            .collect();

        assert!(engine.mark_recovering());
        let floor = engine.current_rate();
        assert_eq!(floor, 300.0);

        let mut previous = floor;
        let mut ramped_at = None;
        let mut total = 0;
        for step in 1..=150u32 {
            clock.advance(Duration::from_millis(100));
            let issued = engine.tick();
            let rate = engine.current_rate();
            assert!(rate >= previous, "rate fell from {previous} to {rate}");
            let allotment = (rate / 60.0 * 0.1).max(1.0);
            assert!(
                issued as f64 <= allotment,
                "{issued} issued at {rate} rpm on step {step}"
            );
            if ramped_at.is_none() && rate >= 1200.0 {
                ramped_at = Some(step);
            }
            previous = rate;
            total += issued;
        }

        // 100 steps of 100ms is the 10s ramp
        let ramped_at = ramped_at.expect("reached the rate limit");
        assert!((99..=101).contains(&ramped_at), "ramped at step {ramped_at}");
        assert_eq!(engine.current_rate(), 1200.0);
        assert_eq!(engine.block_state(), BlockState::Open);
        assert!(total < 301, "backlog still waiting");
    }

    #[test]
    fn test_zero_queue_bound_still_issues_immediately() {
        let (engine, _clock) = engine_with(EngineConfig {
            queue_bound: Some(0),
            ..config(60)
        });
        let first = spend_initial_allowance(&engine);
        assert_eq!(first.caller(), "warmup");
        assert_eq!(
            engine.submit("queued", false).unwrap_err(),
            AdmissionError::Overflow {
                queue_length: 0,
                bound: 0
            }
        );
        let counts = engine.counts();
        assert_eq!(counts.requested, 2);
        assert_eq!(counts.issued, 1);
        assert_eq!(counts.overflow, 1);
    }

    #[test]
    fn test_dropped_immediate_waiter_is_abandoned() {
        let (engine, _clock) = engine_with(config(60));
        let waiter = engine.submit("a", false).unwrap();
        assert_eq!(engine.snapshot().outstanding, 1);

        drop(waiter);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.outstanding, 0);
        assert_eq!(snapshot.counts.issued, 1);
        assert_eq!(snapshot.counts.abandoned, 1);
    }

    #[test]
    fn test_shutdown_fails_waiters_and_new_requests() {
        let (engine, _clock) = engine_with(config(60));
        let _first = spend_initial_allowance(&engine);
        let waiter = engine.submit("waiting", false).unwrap();

        engine.shutdown();
        assert_eq!(
            waiter.now_or_never().expect("resolved"),
            Err(AdmissionError::ShuttingDown)
        );
        assert_eq!(
            engine.submit("late", false).unwrap_err(),
            AdmissionError::ShuttingDown
        );
        assert!(engine.is_shutting_down());
        assert_eq!(engine.tick(), 0);
    }

    #[test]
    fn test_recovering_returns_to_open_when_backlog_drained() {
        let (engine, clock) = engine_with(EngineConfig {
            ramp_duration: Duration::from_secs(1),
            ..config(600)
        });
        let ticket = spend_initial_allowance(&engine);
        let retry = engine.report_exception(ticket).unwrap();
        assert!(engine.mark_recovering());
        assert!(!engine.mark_recovering());

        let mut retry = Some(retry);
        for _ in 0..50 {
            clock.advance(Duration::from_millis(100));
            engine.tick();
            if let Some(w) = retry.as_mut() {
                if let Some(result) = w.now_or_never() {
                    let t = result.expect("issued");
                    engine.finish(t).unwrap();
                    retry = None;
                }
            }
        }
        assert!(retry.is_none());
        assert_eq!(engine.block_state(), BlockState::Open);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = AdmissionEngine::new("bad", EngineConfig::with_rate_limit(0));
        assert!(matches!(result, Err(ConfigError::ZeroRateLimit)));
    }

    #[test]
    fn test_block_state_display() {
        assert_eq!(BlockState::Open.to_string(), "open");
        assert_eq!(BlockState::Blocked.to_string(), "blocked");
        assert_eq!(BlockState::Recovering.to_string(), "recovering");
    }
}
