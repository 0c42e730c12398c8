//! Progress streaming: the event contract and the sink seam.
//!
//! The manager emits [`ProgressEvent`]s onto one sink per execution; sinks
//! deliver them to their medium (an in-memory buffer for SSE fetchers, or
//! an HTTP webhook). Sink failures are logged and never fail the
//! producing task.

pub mod memory;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::{EventStore, MemorySink};
pub use webhook::{WebhookConfig, WebhookMethod, WebhookSink};

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStart,
    Progress,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    Final,
}

/// One progress event emitted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

impl ProgressEvent {
    fn base(task_id: &str, kind: EventKind, progress: f64) -> Self {
        Self {
            task_id: task_id.to_owned(),
            kind,
            progress,
            timestamp: Utc::now(),
            status: None,
            message: None,
            result: None,
            error: None,
            is_final: false,
        }
    }

    pub fn task_start(task_id: &str) -> Self {
        let mut event = Self::base(task_id, EventKind::TaskStart, 0.0);
        event.status = Some("in_progress".to_owned());
        event
    }

    pub fn progress(task_id: &str, progress: f64, message: impl Into<String>) -> Self {
        let mut event = Self::base(task_id, EventKind::Progress, progress);
        event.status = Some("in_progress".to_owned());
        event.message = Some(message.into());
        event
    }

    pub fn task_completed(task_id: &str, result: Option<Value>) -> Self {
        let mut event = Self::base(task_id, EventKind::TaskCompleted, 1.0);
        event.status = Some("completed".to_owned());
        event.result = result;
        event
    }

    pub fn task_failed(task_id: &str, error: impl Into<String>) -> Self {
        let mut event = Self::base(task_id, EventKind::TaskFailed, 0.0);
        event.status = Some("failed".to_owned());
        event.error = Some(error.into());
        event
    }

    pub fn task_cancelled(task_id: &str) -> Self {
        let mut event = Self::base(task_id, EventKind::TaskCancelled, 0.0);
        event.status = Some("cancelled".to_owned());
        event
    }

    pub fn final_event(task_id: &str, status: &str, result: Option<Value>) -> Self {
        let mut event = Self::base(task_id, EventKind::Final, 1.0);
        event.status = Some(status.to_owned());
        event.result = result;
        event.is_final = true;
        event
    }
}

/// A consumer of progress events.
///
/// `put` enqueues; `close` flushes the queue and stops the consumer loop.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn put(&self, event: ProgressEvent);

    async fn close(&self);

    /// Sinks that cannot represent cancellation receive `task_failed`
    /// instead of `task_cancelled`.
    fn supports_cancel_events(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_snake_case() {
        let event = ProgressEvent::task_start("t1");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "task_start");
        assert_eq!(value["task_id"], "t1");
        assert_eq!(value["final"], false);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn final_event_is_marked() {
        let event = ProgressEvent::final_event("root", "completed", None);
        assert!(event.is_final);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["final"], true);
        assert_eq!(value["status"], "completed");
    }

    #[test]
    fn failure_event_carries_error() {
        let event = ProgressEvent::task_failed("t", "boom");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["error"], "boom");
        assert_eq!(value["status"], "failed");
    }

    #[test]
    fn event_roundtrips() {
        let event = ProgressEvent::task_completed("t", Some(serde_json::json!({"n": 1})));
        let text = serde_json::to_string(&event).unwrap();
        let back: ProgressEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, EventKind::TaskCompleted);
        assert_eq!(back.result.unwrap()["n"], 1);
    }
}
