//! Engine registry, lifecycle and session logging.
//!
//! A [`Monitor`] owns every engine it hands out. While running it keeps one
//! sampling task that appends per-interval [`LogEvent`]s to
//! `<log_directory>/<start_epoch>.jsonl`; nothing else writes that file.
//! Tests create independent monitors, each with its own directory.

mod event;
mod sampler;
mod writer;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{
    AdmissionEngine, DefaultRateLimitedService, DriverHandle, EngineSnapshot, RateLimitedService,
};
use crate::config::{MonitorConfig, DEFAULT_SERVICE_NAME};
use crate::error_handling::{ConfigError, MonitorError};

pub use event::{EngineKey, EventListener, LogEvent};

use sampler::run_sampler;
use writer::SessionLog;

#[derive(Default)]
struct Registry {
    engines: BTreeMap<EngineKey, AdmissionEngine>,
    /// Drivers keyed by engine name, so a shared engine is driven once
    drivers: HashMap<String, DriverHandle>,
    services: Vec<Arc<dyn RateLimitedService>>,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl Registry {
    fn service_named(&self, name: &str) -> Option<Arc<dyn RateLimitedService>> {
        self.services
            .iter()
            .find(|s| s.service_name() == name)
            .cloned()
    }
}

pub(crate) struct MonitorShared {
    config: MonitorConfig,
    registry: Mutex<Registry>,
    cancel: CancellationToken,
}

impl MonitorShared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[allow(clippy::type_complexity)]
    fn sampling_view(&self) -> (Vec<(EngineKey, AdmissionEngine)>, Vec<Arc<dyn EventListener>>) {
        let registry = self.lock();
        let engines = registry
            .engines
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        (engines, registry.listeners.clone())
    }
}

struct Running {
    shared: Arc<MonitorShared>,
    sampler: JoinHandle<()>,
    log_path: PathBuf,
}

/// Owner of the engine registry and the session log.
///
/// # Examples
///
/// ```no_run
/// use ratellmiter::{Monitor, MonitorConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let monitor = Monitor::new();
/// monitor.start(MonitorConfig::default())?;
///
/// let engine = monitor.get_or_create_engine("openai", Some("gpt-4o"))?;
/// let ticket = engine.request_ticket("job-1", false).await?;
/// engine.finish(ticket)?;
///
/// monitor.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Monitor {
    running: Mutex<Option<Running>>,
}

impl Monitor {
    /// A stopped monitor; call [`start`](Self::start) to use it.
    pub fn new() -> Self {
        Self::default()
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn shared(&self) -> Result<Arc<MonitorShared>, MonitorError> {
        self.running()
            .as_ref()
            .map(|r| Arc::clone(&r.shared))
            .ok_or(MonitorError::NotRunning)
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Path of the current session log, while running.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.running().as_ref().map(|r| r.log_path.clone())
    }

    /// Starts the sampling task and creates the default engine.
    ///
    /// Must be called inside a tokio runtime. Returns the session log path.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::AlreadyRunning`] if already started
    /// - [`MonitorError::Config`] for an unusable configuration
    /// - [`MonitorError::LogDirectory`] if the log directory cannot be created
    pub fn start(&self, config: MonitorConfig) -> Result<PathBuf, MonitorError> {
        let mut running = self.running();
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }
        if config.sample_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sample_interval").into());
        }
        let default_key = EngineKey::new(DEFAULT_SERVICE_NAME, None);
        let default_engine =
            AdmissionEngine::new(default_key.name(), config.engine_config_for(&default_key.name()))?;

        let directory = config.resolved_log_directory();
        let log = SessionLog::create(&directory, Utc::now())?;
        let log_path = log.path().to_path_buf();

        let mut registry = Registry::default();
        registry.services.push(DefaultRateLimitedService::attach(default_engine.clone()));
        registry
            .drivers
            .insert(default_key.name(), default_engine.start_driver());
        registry.engines.insert(default_key, default_engine);

        let shared = Arc::new(MonitorShared {
            config,
            registry: Mutex::new(registry),
            cancel: CancellationToken::new(),
        });
        let sampler = tokio::spawn(run_sampler(Arc::clone(&shared), log));

        log::info!("Rate limiter monitor started, logging to {}", log_path.display());
        *running = Some(Running {
            shared,
            sampler,
            log_path: log_path.clone(),
        });
        Ok(log_path)
    }

    /// Stops every engine and the sampler, writing a final sample.
    ///
    /// Waiting requests fail with `ShuttingDown`. Once this returns no task
    /// of this monitor writes to the log. Stopping a stopped monitor is a no-op.
    ///
    /// # Errors
    ///
    /// [`MonitorError::TaskJoin`] if a background task panicked.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let Some(running) = self.running().take() else {
            return Ok(());
        };
        let shared = running.shared;

        let engines: Vec<AdmissionEngine> = shared.lock().engines.values().cloned().collect();
        for engine in &engines {
            engine.shutdown();
        }

        shared.cancel.cancel();
        let mut result = running.sampler.await.map_err(MonitorError::from);
        if let Err(e) = &result {
            log::error!("Sampler task failed: {}", e);
        }

        let drivers: Vec<DriverHandle> = shared.lock().drivers.drain().map(|(_, d)| d).collect();
        for driver in drivers {
            if let Err(e) = driver.join().await {
                log::error!("Engine driver failed: {}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        log::info!(
            "Rate limiter monitor stopped, {} engine(s) shut down",
            engines.len()
        );
        result
    }

    /// Returns the engine for `service` (and `model`), creating it on first use.
    ///
    /// A registered service whose [`RateLimitedService::engine`] returns an
    /// engine supplies it, which lets one engine serve several models.
    /// Otherwise a new engine gets the rate from `rate_limit_overrides` for its
    /// name, or `default_rate_limit`.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::NotRunning`] if the monitor is stopped
    /// - [`MonitorError::Config`] if the resolved rate limit is zero
    pub fn get_or_create_engine(
        &self,
        service: &str,
        model: Option<&str>,
    ) -> Result<AdmissionEngine, MonitorError> {
        let shared = self.shared()?;
        let key = EngineKey::new(service, model);

        let provider = {
            let registry = shared.lock();
            if let Some(engine) = registry.engines.get(&key) {
                return Ok(engine.clone());
            }
            registry.service_named(service)
        };
        // Called without the registry lock; implementations are application code
        let provided = provider.as_ref().and_then(|s| s.engine(model));

        let mut registry = shared.lock();
        if let Some(engine) = registry.engines.get(&key) {
            return Ok(engine.clone());
        }
        let engine = match provided {
            Some(engine) => engine,
            None => AdmissionEngine::new(key.name(), shared.config.engine_config_for(&key.name()))?,
        };
        if let Some(service) = &provider {
            engine.attach_service(service);
        }
        if !registry.drivers.contains_key(engine.name()) {
            registry
                .drivers
                .insert(engine.name().to_string(), engine.start_driver());
        }
        log::debug!(
            "Registered engine {} at {} rpm",
            key,
            engine.config().rate_limit
        );
        registry.engines.insert(key, engine.clone());
        Ok(engine)
    }

    /// The engine of the built-in `default` service.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotRunning`] if the monitor is stopped.
    pub fn default_engine(&self) -> Result<AdmissionEngine, MonitorError> {
        self.get_or_create_engine(DEFAULT_SERVICE_NAME, None)
    }

    /// Registers `service` as the probe for its engines.
    ///
    /// Existing engines of the same service name get it attached unless they
    /// already have a live service.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotRunning`] if the monitor is stopped.
    pub fn register_service(&self, service: Arc<dyn RateLimitedService>) -> Result<(), MonitorError> {
        let shared = self.shared()?;
        let name = service.service_name();
        let mut registry = shared.lock();
        for (key, engine) in &registry.engines {
            if key.service == name {
                engine.attach_service(&service);
            }
        }
        registry.services.retain(|s| s.service_name() != name);
        registry.services.push(service);
        log::debug!("Registered rate limited service {}", name);
        Ok(())
    }

    /// Adds a listener that sees every sampled event.
    ///
    /// # Errors
    ///
    /// [`MonitorError::NotRunning`] if the monitor is stopped.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> Result<(), MonitorError> {
        let shared = self.shared()?;
        shared.lock().listeners.push(listener);
        Ok(())
    }

    /// Snapshots of all registered engines, ordered by key.
    pub fn snapshots(&self) -> Vec<(EngineKey, EngineSnapshot)> {
        let Ok(shared) = self.shared() else {
            return Vec::new();
        };
        let engines: Vec<_> = shared
            .lock()
            .engines
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        engines
            .into_iter()
            .map(|(key, engine)| (key, engine.snapshot()))
            .collect()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Best effort when dropped without stop(): loops exit, nothing is joined
        if let Some(running) = self.running().take() {
            for engine in running.shared.lock().engines.values() {
                engine.shutdown();
            }
            running.shared.cancel.cancel();
        }
    }
}
