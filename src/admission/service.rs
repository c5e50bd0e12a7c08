//! Rate-limited services: the probe side of an engine.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::engine::AdmissionEngine;
use crate::config::DEFAULT_SERVICE_NAME;
use crate::error_handling::ProbeError;

/// A remote API whose calls go through one or more admission engines.
///
/// Implementors answer the recovery probe: while an engine is blocked, the
/// prober periodically awaits [`is_blocked`](Self::is_blocked) and reopens
/// the engine once it returns `Ok(false)`. Errors are logged and treated as
/// "still blocked".
///
/// # Examples
///
/// ```
/// use futures::future::BoxFuture;
/// use futures::FutureExt;
/// use ratellmiter::{AdmissionEngine, ProbeError, RateLimitedService};
///
/// struct OpenAi {
///     engine: AdmissionEngine,
/// }
///
/// impl RateLimitedService for OpenAi {
///     fn is_blocked(&self) -> BoxFuture<'_, Result<bool, ProbeError>> {
///         // A cheap request against the API would go here
///         async { Ok(false) }.boxed()
///     }
///
///     fn service_name(&self) -> String {
///         "openai".to_string()
///     }
///
///     fn engine(&self, _model: Option<&str>) -> Option<AdmissionEngine> {
///         Some(self.engine.clone())
///     }
/// }
/// ```
pub trait RateLimitedService: Send + Sync {
    /// Checks whether the upstream still rejects requests.
    fn is_blocked(&self) -> BoxFuture<'_, Result<bool, ProbeError>>;

    /// Name used in engine names and log events.
    fn service_name(&self) -> String;

    /// Engine handling `model`, if this service already has one.
    fn engine(&self, model: Option<&str>) -> Option<AdmissionEngine>;
}

/// Service that never reports a block.
///
/// Backs the monitor's default engine, so rejections reported there clear on
/// the first probe.
#[derive(Debug, Clone)]
pub struct DefaultRateLimitedService {
    engine: AdmissionEngine,
}

impl DefaultRateLimitedService {
    /// Creates the service and attaches it to `engine`.
    pub fn attach(engine: AdmissionEngine) -> Arc<dyn RateLimitedService> {
        let service: Arc<dyn RateLimitedService> =
            Arc::new(DefaultRateLimitedService { engine: engine.clone() });
        engine.attach_service(&service);
        service
    }
}

impl RateLimitedService for DefaultRateLimitedService {
    fn is_blocked(&self) -> BoxFuture<'_, Result<bool, ProbeError>> {
        async { Ok(false) }.boxed()
    }

    fn service_name(&self) -> String {
        DEFAULT_SERVICE_NAME.to_string()
    }

    fn engine(&self, _model: Option<&str>) -> Option<AdmissionEngine> {
        Some(self.engine.clone())
    }
}
