use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, TrackingEvent};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};
use uuid::Uuid;

/// Builder configuring experiment telemetry sinks.
pub struct ExperimentTelemetryBuilder {
    module: String,
    run_id: Option<String>,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ExperimentTelemetryBuilder {
    /// Creates a new builder for the given module label.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            run_id: None,
            log_path: None,
            event_publisher: None,
        }
    }

    /// Fixes the run identifier; a random one is generated otherwise.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Registers the publisher receiving tracking events.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<ExperimentTelemetry> {
        let run_id = self
            .run_id
            .unwrap_or_else(|| format!("run-{}", Uuid::new_v4()));
        ExperimentTelemetry::new(self.module, run_id, self.log_path, self.event_publisher)
    }
}

/// Structured log and tracking-event handle shared by one experiment.
#[derive(Clone)]
pub struct ExperimentTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ExperimentTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExperimentTelemetry")
            .field("module", &self.inner.module)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    run_id: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
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

    fn publish(&self, event: TrackingEvent) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(event).await {
                    eprintln!("tracking event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(event))
        }
    }
}

impl ExperimentTelemetry {
    fn new(
        module: String,
        run_id: String,
        log_path: Option<PathBuf>,
        event_publisher: Option<Arc<dyn EventPublisher>>,
    ) -> Result<Self> {
        let logger = log_path.map(JsonLogger::new).transpose()?;
        let event = event_publisher.map(EventHandle::new).transpose()?;
        Ok(Self {
            inner: Arc::new(TelemetryInner {
                module,
                run_id,
                logger,
                event,
            }),
        })
    }

    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ExperimentTelemetryBuilder {
        ExperimentTelemetryBuilder::new(module)
    }

    /// Handle with no sinks; every call is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "experiment".into(),
                run_id: "offline".into(),
                logger: None,
                event: None,
            }),
        }
    }

    /// Identifier stamped on every tracking event.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(self.inner.module.as_str(), level, message)
                .with_field("run_id", self.inner.run_id.as_str());
            if let Some(obj) = metadata.as_object() {
                record.metadata.extend(obj.clone());
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits a run-level tracking event.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        self.emit(event_type, None, payload)
    }

    /// Emits a tracking event tagged with a trial index.
    pub fn event_at(&self, event_type: &str, step: u64, payload: Value) -> Result<()> {
        self.emit(event_type, Some(step), payload)
    }

    fn emit(&self, event_type: &str, step: Option<u64>, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            let mut event = TrackingEvent::new(
                self.inner.run_id.as_str(),
                self.inner.module.as_str(),
                event_type,
                payload,
            );
            if let Some(step) = step {
                event = event.at_step(step);
            }
            handle.publish(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_logs_and_emits() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("experiment.log");
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = ExperimentTelemetry::builder("experiment")
            .run_id("run-7")
            .log_path(&log_path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "experiment.started", json!({ "seeds": 3 }))
            .unwrap();
        telemetry
            .event_at("experiment.trial.completed", 2, json!({ "train_time": 0.5 }))
            .unwrap();
        let records = shared_logging::read_records(&log_path).unwrap();
        assert_eq!(records[0].message, "experiment.started");
        assert_eq!(records[0].number("seeds"), Some(3.0));
        assert_eq!(records[0].metadata["run_id"], "run-7");
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_id, "run-7");
        assert_eq!(events[0].step, Some(2));
    }

    #[test]
    fn disabled_telemetry_is_silent() {
        let telemetry = ExperimentTelemetry::disabled();
        telemetry.log(LogLevel::Warn, "nothing", Value::Null).unwrap();
        telemetry.event("nothing", Value::Null).unwrap();
        assert_eq!(telemetry.run_id(), "offline");
    }
}
