//! Log events and the keys that identify engines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::{BlockState, EngineSnapshot, EventCounts};

/// Registry key of an engine: a service, optionally narrowed to one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineKey {
    /// Service name, e.g. `openai`
    pub service: String,
    /// Model within the service, if engines are per model
    pub model: Option<String>,
}

impl EngineKey {
    /// Key for `service`, narrowed to `model` when given.
    pub fn new(service: impl Into<String>, model: Option<&str>) -> Self {
        EngineKey {
            service: service.into(),
            model: model.map(str::to_string),
        }
    }

    /// `service` or `service/model`; used as the engine name and for overrides.
    pub fn name(&self) -> String {
        match &self.model {
            Some(model) => format!("{}/{}", self.service, model),
            None => self.service.clone(),
        }
    }
}

impl fmt::Display for EngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One line of the session log: an engine's activity during one sample interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Service of the engine's key
    pub service: String,
    /// Model of the engine's key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Counts since the previous sample of this engine
    pub counts: EventCounts,
    /// Block state at sample time
    pub state: BlockState,
    /// Ramped rate in requests per minute at sample time
    pub current_rate: f64,
    /// Waiting tickets at sample time
    pub queue_length: usize,
}

impl LogEvent {
    pub(crate) fn from_snapshot(
        timestamp: DateTime<Utc>,
        key: &EngineKey,
        snapshot: &EngineSnapshot,
        counts: EventCounts,
    ) -> Self {
        LogEvent {
            timestamp,
            service: key.service.clone(),
            model: key.model.clone(),
            counts,
            state: snapshot.block_state,
            current_rate: snapshot.current_rate,
            queue_length: snapshot.queue_length,
        }
    }

    /// Engine name this event belongs to (`service` or `service/model`).
    pub fn engine_name(&self) -> String {
        match &self.model {
            Some(model) => format!("{}/{}", self.service, model),
            None => self.service.clone(),
        }
    }
}

/// Receives every event the monitor samples, before it is written.
///
/// Called from the sampling task; implementations should return quickly. A
/// listener that panics is logged and skipped for that event.
pub trait EventListener: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: &LogEvent);
}
