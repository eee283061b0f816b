use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};

/// Builder for learning telemetry sinks.
pub struct LearningTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl LearningTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<LearningTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(JsonLogger::with_min_level(path, self.min_level)?)),
            None => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(Arc::new(EventHandle::new(publisher)?)),
            None => None,
        };
        Ok(LearningTelemetry {
            module: self.module,
            logger,
            event,
        })
    }
}

/// Telemetry handle shared by the data, training and evaluation stages.
///
/// Cloning is cheap; [`LearningTelemetry::scoped`] derives a handle that
/// shares sinks but reports under a sub-component name.
#[derive(Clone)]
pub struct LearningTelemetry {
    module: String,
    logger: Option<Arc<JsonLogger>>,
    event: Option<Arc<EventHandle>>,
}

impl fmt::Debug for LearningTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LearningTelemetry")
            .field("module", &self.module)
            .field("logs", &self.logger.is_some())
            .field("events", &self.event.is_some())
            .finish()
    }
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        Ok(Self {
            runtime: Runtime::new()?,
            publisher,
        })
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl LearningTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> LearningTelemetryBuilder {
        LearningTelemetryBuilder::new(module)
    }

    /// Handle reporting as `<module>.<component>`.
    #[must_use]
    pub fn scoped(&self, component: &str) -> Self {
        Self {
            module: format!("{}.{component}", self.module),
            logger: self.logger.clone(),
            event: self.event.clone(),
        }
    }

    /// Component name used in records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.logger {
            if logger.enabled(level) {
                let record = LogRecord::new(&self.module, level, message).with_metadata(metadata);
                logger.log(&record)?;
            }
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.event {
            handle.publish(EventRecord::new(&self.module, event_type, payload))?;
        }
        Ok(())
    }
}

/// Logs through an optional handle, ignoring sink failures.
pub(crate) fn log(telemetry: Option<&LearningTelemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(tel) = telemetry {
        let _ = tel.log(level, message, metadata);
    }
}

/// Emits through an optional handle, ignoring sink failures.
pub(crate) fn event(telemetry: Option<&LearningTelemetry>, event_type: &str, payload: Value) {
    if let Some(tel) = telemetry {
        let _ = tel.event(event_type, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("learning.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = LearningTelemetry::builder("graphrec")
            .log_path(&path)
            .min_level(LogLevel::Info)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let trainer = telemetry.scoped("trainer");
        trainer
            .log(LogLevel::Info, "epoch_completed", json!({ "epoch": 1 }))
            .unwrap();
        trainer
            .log(LogLevel::Debug, "batch_completed", json!({ "batch": 3 }))
            .unwrap();
        trainer
            .event("training.epoch_completed", json!({ "loss": 0.5 }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("epoch_completed"));
        assert!(content.contains("graphrec.trainer"));
        assert!(!content.contains("batch_completed"));
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "graphrec.trainer");
    }

    #[test]
    fn silent_without_sinks() {
        let telemetry = LearningTelemetry::builder("quiet").build().unwrap();
        telemetry.log(LogLevel::Error, "x", json!({})).unwrap();
        telemetry.event("x", json!({})).unwrap();
        log(None, LogLevel::Info, "noop", json!({}));
    }
}
