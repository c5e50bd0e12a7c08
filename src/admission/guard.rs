//! Scoped tickets and the retrying call wrapper.

use std::future::Future;

use super::engine::{AdmissionEngine, TicketWaiter};
use super::ticket::{Ticket, TicketRecord};
use crate::config::RATE_LIMIT_RETRIES;
use crate::error_handling::{LimitedCallError, TicketError};

/// An issued ticket that is finished automatically when dropped.
///
/// Use [`reject`](Self::reject) when the upstream refused the call; any other
/// way out of the scope counts as finished.
#[derive(Debug)]
pub struct TicketGuard {
    engine: AdmissionEngine,
    ticket: Option<Ticket>,
}

impl TicketGuard {
    pub(crate) fn new(engine: AdmissionEngine, ticket: Ticket) -> Self {
        TicketGuard {
            engine,
            ticket: Some(ticket),
        }
    }

    /// The guarded ticket, `None` only after it has been closed.
    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }

    /// Finishes the ticket now.
    ///
    /// # Errors
    ///
    /// See [`AdmissionEngine::finish`].
    pub fn finish(mut self) -> Result<Option<TicketRecord>, TicketError> {
        match self.ticket.take() {
            Some(ticket) => self.engine.finish(ticket).map(Some),
            None => Ok(None),
        }
    }

    /// Reports an upstream rejection and returns the waiter for the retry ticket.
    ///
    /// # Errors
    ///
    /// See [`AdmissionEngine::report_exception`].
    pub fn reject(mut self) -> Result<Option<TicketWaiter>, TicketError> {
        match self.ticket.take() {
            Some(ticket) => self.engine.report_exception(ticket).map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            if let Err(e) = self.engine.finish(ticket) {
                log::warn!("[{}] failed to finish guarded ticket: {}", self.engine.name(), e);
            }
        }
    }
}

/// Classifies failures of wrapped work as upstream rate-limit rejections.
pub trait UpstreamRejection {
    /// True when the upstream refused the call because of rate limits.
    fn is_upstream_rejection(&self) -> bool;
}

/// Runs `work` under a ticket, retrying upstream rejections.
///
/// Each attempt holds its own ticket. A rejection is reported to the engine,
/// which blocks and re-queues the caller with priority; the next attempt runs
/// when the retry ticket is issued. Other errors finish the ticket and are
/// returned as [`LimitedCallError::Inner`] without retrying.
///
/// # Errors
///
/// - [`LimitedCallError::Admission`] if no ticket could be obtained
/// - [`LimitedCallError::RetriesExhausted`] after `max_attempts` rejections
/// - [`LimitedCallError::Inner`] for non-rejection failures
/// - [`LimitedCallError::Ticket`] if the engine refused to close a ticket
///
/// # Examples
///
/// ```no_run
/// use ratellmiter::{call_limited, AdmissionEngine, EngineConfig, UpstreamRejection};
///
/// #[derive(Debug)]
/// struct ApiError { status: u16 }
///
/// impl UpstreamRejection for ApiError {
///     fn is_upstream_rejection(&self) -> bool {
///         self.status == 429
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = AdmissionEngine::new("openai", EngineConfig::with_rate_limit(600))?;
/// let _driver = engine.start_driver();
/// let answer = call_limited(&engine, "job-7", 20, || async {
///     Ok::<_, ApiError>("completion".to_string())
/// })
/// .await;
/// # Ok(())
/// # }
/// ```
pub async fn call_limited<T, E, F, Fut>(
    engine: &AdmissionEngine,
    caller: &str,
    max_attempts: usize,
    mut work: F,
) -> Result<T, LimitedCallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: UpstreamRejection,
{
    let attempts = max_attempts.max(1);
    let mut guard = engine.acquire(caller).await?;
    let mut attempt = 1;
    loop {
        match work().await {
            Ok(value) => {
                guard.finish()?;
                return Ok(value);
            }
            Err(e) if e.is_upstream_rejection() => {
                let retry = guard.reject()?;
                if attempt >= attempts {
                    // Dropping the retry waiter withdraws the priority request
                    drop(retry);
                    log::warn!(
                        "[{}] {} rejected upstream {} times, giving up",
                        engine.name(),
                        caller,
                        attempts
                    );
                    return Err(LimitedCallError::RetriesExhausted { attempts, last: e });
                }
                let Some(retry) = retry else {
                    return Err(LimitedCallError::Inner(e));
                };
                let ticket = retry.await?;
                guard = TicketGuard::new(engine.clone(), ticket);
                attempt += 1;
            }
            Err(e) => {
                guard.finish()?;
                return Err(LimitedCallError::Inner(e));
            }
        }
    }
}

/// [`call_limited`] with [`RATE_LIMIT_RETRIES`] attempts.
pub async fn call_limited_default<T, E, F, Fut>(
    engine: &AdmissionEngine,
    caller: &str,
    work: F,
) -> Result<T, LimitedCallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: UpstreamRejection,
{
    call_limited(engine, caller, RATE_LIMIT_RETRIES, work).await
}
