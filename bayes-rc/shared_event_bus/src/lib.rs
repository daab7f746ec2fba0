#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Tracking-event sinks for experiment runs.
//!
//! A run publishes one event per completed trial and one per aggregate metric.
//! Sinks are async so a remote tracker can be plugged in behind the same trait;
//! the two shipped here keep events in memory or append them to a JSONL file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use uuid::Uuid;

/// Tracking event encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Experiment run the event belongs to.
    pub run_id: String,
    /// Component producing the event.
    pub source: String,
    /// Event type (e.g., `experiment.metric`).
    pub event_type: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Trial index for per-seed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TrackingEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: run_id.into(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            step: None,
            payload,
        }
    }

    /// Tags the event with a trial index.
    #[must_use]
    pub fn at_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the sink.
    async fn publish(&self, event: TrackingEvent) -> Result<()>;
}

/// In-memory bounded sink (for local development and tests).
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    capacity: usize,
    backlog: Arc<Mutex<VecDeque<TrackingEvent>>>,
}

impl MemoryEventBus {
    /// Creates a bus retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
        }
    }

    /// Snapshot of retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TrackingEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events of a given type, oldest first.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<TrackingEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: TrackingEvent) -> Result<()> {
        let mut backlog = self.backlog.lock();
        if backlog.len() == self.capacity {
            backlog.pop_front();
        }
        backlog.push_back(event);
        Ok(())
    }
}

/// File-backed publisher for durable run histories.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Returns the event log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: TrackingEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    fn metric_event(name: &str, value: f64) -> TrackingEvent {
        TrackingEvent::new(
            "run-1",
            "tracker",
            "experiment.metric",
            serde_json::json!({ "name": name, "value": value }),
        )
    }

    #[test]
    fn memory_bus_drops_oldest_when_full() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(2);
            bus.publish(metric_event("m_mse", 1.0)).await.unwrap();
            bus.publish(metric_event("s_mse", 0.0)).await.unwrap();
            bus.publish(
                TrackingEvent::new("run-1", "trial_loop", "experiment.trial.completed", serde_json::json!({}))
                    .at_step(0),
            )
            .await
            .unwrap();
            let events = bus.snapshot();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].payload["name"], "s_mse");
            assert_eq!(bus.of_type("experiment.trial.completed")[0].step, Some(0));
        });
    }

    #[test]
    fn file_publisher_appends_lines() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempdir().unwrap();
            let publisher = FileEventPublisher::new(dir.path().join("events/run.jsonl")).unwrap();
            publisher.publish(metric_event("m_crps", 0.4)).await.unwrap();
            publisher.publish(metric_event("s_crps", 0.1)).await.unwrap();
            let content = std::fs::read_to_string(publisher.path()).unwrap();
            assert_eq!(content.lines().count(), 2);
            assert!(content.contains("m_crps"));
        });
    }
}
