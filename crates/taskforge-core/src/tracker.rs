//! In-process registry of running root tasks.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// One running root-task execution.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub root_task_id: String,
    pub started_at: DateTime<Utc>,
}

/// Mutex-protected set of root task ids currently executing in this
/// process. Updated by the facade at root start/stop.
#[derive(Debug, Default)]
pub struct TaskTracker {
    running: Mutex<HashMap<String, RunningTask>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a root task as running. Returns false when it already was,
    /// which callers treat as "already running".
    pub fn start_tracking(&self, root_task_id: &str) -> bool {
        let mut running = self.running.lock().expect("tracker lock poisoned");
        if running.contains_key(root_task_id) {
            return false;
        }
        running.insert(
            root_task_id.to_owned(),
            RunningTask {
                root_task_id: root_task_id.to_owned(),
                started_at: Utc::now(),
            },
        );
        true
    }

    /// Remove a root task from the running set.
    pub fn stop_tracking(&self, root_task_id: &str) {
        self.running
            .lock()
            .expect("tracker lock poisoned")
            .remove(root_task_id);
    }

    pub fn is_running(&self, root_task_id: &str) -> bool {
        self.running
            .lock()
            .expect("tracker lock poisoned")
            .contains_key(root_task_id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.running
            .lock()
            .expect("tracker lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().expect("tracker lock poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<RunningTask> {
        self.running
            .lock()
            .expect("tracker lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_and_untrack() {
        let tracker = TaskTracker::new();
        assert!(tracker.start_tracking("root-1"));
        assert!(tracker.is_running("root-1"));
        assert_eq!(tracker.running_count(), 1);

        tracker.stop_tracking("root-1");
        assert!(!tracker.is_running("root-1"));
        assert_eq!(tracker.running_count(), 0);
    }

    #[test]
    fn double_start_is_rejected() {
        let tracker = TaskTracker::new();
        assert!(tracker.start_tracking("root-1"));
        assert!(!tracker.start_tracking("root-1"));
    }

    #[test]
    fn snapshot_carries_start_time() {
        let tracker = TaskTracker::new();
        tracker.start_tracking("root-1");
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].root_task_id, "root-1");
    }

    #[test]
    fn stop_unknown_is_noop() {
        let tracker = TaskTracker::new();
        tracker.stop_tracking("never-started");
        assert_eq!(tracker.running_count(), 0);
    }
}
