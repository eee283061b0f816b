#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Event bus for training lifecycle notifications (epochs, evaluations, exports).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};
use uuid::Uuid;

/// Lifecycle event encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier (`evt-<uuid>`).
    pub id: String,
    /// Component producing the event.
    pub source: String,
    /// Dotted event type (e.g. `training.epoch_completed`).
    pub event_type: String,
    /// RFC3339 timestamp.
    pub timestamp: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Creates an event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }
}

/// Event publisher interface.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    async fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Event subscriber interface.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Returns a receiver for events published after the call.
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>>;
}

/// In-memory broadcast bus retaining a bounded backlog.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<EventRecord>,
    backlog: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Snapshot of retained events, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events whose type starts with `prefix`.
    #[must_use]
    pub fn by_prefix(&self, prefix: &str) -> Vec<EventRecord> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventBus {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            backlog.push_back(event.clone());
            while backlog.len() > self.capacity {
                backlog.pop_front();
            }
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for MemoryEventBus {
    async fn subscribe(&self) -> Result<broadcast::Receiver<EventRecord>> {
        Ok(self.sender.subscribe())
    }
}

/// Publisher appending JSON lines to a file.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Returns the log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back every event written so far.
    pub fn read_all(&self) -> Result<Vec<EventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading event log {}", self.path.display()))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("decoding event record"))
            .collect()
    }
}

#[async_trait]
impl EventPublisher for FileEventPublisher {
    async fn publish(&self, event: EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let data = serde_json::to_vec(&event)?;
        file.write_all(&data).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    #[test]
    fn publishes_and_receives() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(16);
            let mut rx = bus.subscribe().await.unwrap();
            bus.publish(EventRecord::new("trainer", "training.epoch_completed", json!({ "epoch": 1 })))
                .await
                .unwrap();
            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, "training.epoch_completed");
            assert!(event.id.starts_with("evt-"));
        });
    }

    #[test]
    fn backlog_is_bounded_and_filterable() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let bus = MemoryEventBus::new(2);
            for event_type in ["training.started", "training.epoch_completed", "evaluation.completed"] {
                bus.publish(EventRecord::new("t", event_type, json!({})))
                    .await
                    .unwrap();
            }
            let retained = bus.snapshot();
            assert_eq!(retained.len(), 2);
            assert_eq!(retained[0].event_type, "training.epoch_completed");
            assert_eq!(bus.by_prefix("evaluation.").len(), 1);
        });
    }

    #[test]
    fn file_publisher_round_trips_events() {
        let rt = Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let publisher = FileEventPublisher::new(dir.path().join("events/run.jsonl")).unwrap();
        rt.block_on(async {
            publisher
                .publish(EventRecord::new("cli", "experiment.completed", json!({ "ndcg": 0.4 })))
                .await
                .unwrap();
        });
        let events = publisher.read_all().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["ndcg"], json!(0.4));
    }
}
