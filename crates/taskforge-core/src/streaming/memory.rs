//! In-memory event sink backing the SSE endpoint.
//!
//! Events flow through a bounded queue into a single consumer loop that
//! appends them to a shared per-root buffer. A `None` sentinel shuts the
//! consumer down; `close` waits for the queue to drain first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::{EventSink, ProgressEvent};

const QUEUE_CAPACITY: usize = 256;

/// Shared map from root task id to its append-only event list.
#[derive(Debug, Default)]
pub struct EventStore {
    buffers: Mutex<HashMap<String, Vec<ProgressEvent>>>,
}

impl EventStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append one event to a root's buffer.
    pub fn append(&self, root_task_id: &str, event: ProgressEvent) {
        self.buffers
            .lock()
            .expect("event store lock poisoned")
            .entry(root_task_id.to_owned())
            .or_default()
            .push(event);
    }

    /// Snapshot of the buffered events for a root, in append order.
    pub fn events_for(&self, root_task_id: &str) -> Vec<ProgressEvent> {
        self.buffers
            .lock()
            .expect("event store lock poisoned")
            .get(root_task_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop a root's buffer once its consumer is done with it.
    pub fn clear(&self, root_task_id: &str) {
        self.buffers
            .lock()
            .expect("event store lock poisoned")
            .remove(root_task_id);
    }
}

/// Sink that buffers events in an [`EventStore`] keyed by root task id.
pub struct MemorySink {
    tx: mpsc::Sender<Option<ProgressEvent>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl MemorySink {
    pub fn new(root_task_id: impl Into<String>, store: Arc<EventStore>) -> Self {
        let root_task_id = root_task_id.into();
        let (tx, mut rx) = mpsc::channel::<Option<ProgressEvent>>(QUEUE_CAPACITY);

        let consumer = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Some(event) => store.append(&root_task_id, event),
                    None => break,
                }
            }
        });

        Self {
            tx,
            consumer: Mutex::new(Some(consumer)),
        }
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn put(&self, event: ProgressEvent) {
        if self.tx.send(Some(event)).await.is_err() {
            warn!("memory sink consumer already stopped, dropping event");
        }
    }

    async fn close(&self) {
        let _ = self.tx.send(None).await;
        let handle = self
            .consumer
            .lock()
            .expect("memory sink lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::EventKind;

    #[tokio::test]
    async fn events_append_in_order() {
        let store = EventStore::new();
        let sink = MemorySink::new("root", Arc::clone(&store));

        sink.put(ProgressEvent::task_start("a")).await;
        sink.put(ProgressEvent::task_completed("a", None)).await;
        sink.put(ProgressEvent::final_event("root", "completed", None))
            .await;
        sink.close().await;

        let events = store.events_for("root");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::TaskStart);
        assert_eq!(events[1].kind, EventKind::TaskCompleted);
        assert_eq!(events[2].kind, EventKind::Final);
        assert!(events[2].is_final);
    }

    #[tokio::test]
    async fn close_is_idempotent_for_put() {
        let store = EventStore::new();
        let sink = MemorySink::new("root", Arc::clone(&store));
        sink.close().await;
        // Late put after close must not panic.
        sink.put(ProgressEvent::task_start("a")).await;
        assert!(store.events_for("root").is_empty());
    }

    #[tokio::test]
    async fn buffers_are_per_root() {
        let store = EventStore::new();
        let sink_a = MemorySink::new("root-a", Arc::clone(&store));
        let sink_b = MemorySink::new("root-b", Arc::clone(&store));

        sink_a.put(ProgressEvent::task_start("x")).await;
        sink_b.put(ProgressEvent::task_start("y")).await;
        sink_a.close().await;
        sink_b.close().await;

        assert_eq!(store.events_for("root-a").len(), 1);
        assert_eq!(store.events_for("root-b").len(), 1);
        store.clear("root-a");
        assert!(store.events_for("root-a").is_empty());
    }
}
