//! Pre- and post-execution hooks.
//!
//! Hooks are advisory: a failing hook is logged and never fails the task.
//! Registration is a startup activity; the scheduler captures an immutable
//! `Arc<HookSet>` snapshot at construction.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use taskforge_db::models::{JsonMap, Task};

/// Runs after dependency resolution and before executor dispatch.
///
/// Receives the task and a mutable view of its inputs; any change is
/// detected by deep comparison and persisted before the executor runs.
#[async_trait]
pub trait PreHook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_execute(&self, task: &Task, inputs: &mut JsonMap) -> Result<()>;
}

/// Runs after a task reaches `completed`, before dependent dispatch so
/// notification and logging sinks see completion promptly.
#[async_trait]
pub trait PostHook: Send + Sync {
    fn name(&self) -> &str;

    async fn after_execute(&self, task: &Task, inputs: &JsonMap, result: &Value) -> Result<()>;
}

/// Ordered collections of registered hooks.
#[derive(Default)]
pub struct HookSet {
    pre: Vec<Arc<dyn PreHook>>,
    post: Vec<Arc<dyn PostHook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pre_hook(mut self, hook: impl PreHook + 'static) -> Self {
        self.pre.push(Arc::new(hook));
        self
    }

    pub fn register_post_hook(mut self, hook: impl PostHook + 'static) -> Self {
        self.post.push(Arc::new(hook));
        self
    }

    /// Freeze into the snapshot the scheduler captures.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }

    /// Run every pre-hook in registration order. Failures are swallowed.
    pub async fn run_pre_hooks(&self, task: &Task, inputs: &mut JsonMap) {
        if self.pre.is_empty() {
            return;
        }
        debug!(task_id = %task.id, count = self.pre.len(), "running pre-hooks");
        for hook in &self.pre {
            if let Err(e) = hook.before_execute(task, inputs).await {
                warn!(
                    task_id = %task.id,
                    hook = hook.name(),
                    error = %e,
                    "pre-hook failed, continuing with task execution"
                );
            }
        }
    }

    /// Run every post-hook in registration order. Failures are swallowed
    /// and never re-open the completed task.
    pub async fn run_post_hooks(&self, task: &Task, inputs: &JsonMap, result: &Value) {
        if self.post.is_empty() {
            return;
        }
        debug!(task_id = %task.id, count = self.post.len(), "running post-hooks");
        for hook in &self.post {
            if let Err(e) = hook.after_execute(task, inputs, result).await {
                warn!(
                    task_id = %task.id,
                    hook = hook.name(),
                    error = %e,
                    "post-hook failed, task already completed"
                );
            }
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("pre", &self.pre.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field(
                "post",
                &self.post.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
