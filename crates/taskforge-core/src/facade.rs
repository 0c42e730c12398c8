//! The engine's entry point: accepts task arrays or existing ids, drives
//! the creator and the scheduler, tracks running roots, and owns the
//! shared state cancellation needs.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::error;

use taskforge_db::models::{Task, TaskStatus};
use taskforge_db::repository::{self, QueryFilter, TaskPatch};
use taskforge_db::session::{Session, SessionPool};
use taskforge_db::tree::TaskTree;

use crate::copy::{self, CopyOptions};
use crate::creator::{self, CreateError, TaskSpec};
use crate::executor::ExecutorRegistry;
use crate::hooks::HookSet;
use crate::manager::{CancelReport, LiveExecutorMap, TaskManager};
use crate::streaming::{EventSink, EventStore, MemorySink, ProgressEvent, WebhookConfig, WebhookSink};
use crate::tracker::{RunningTask, TaskTracker};

/// Options for a single `tasks.execute`-style run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub use_streaming: bool,
    pub webhook: Option<WebhookConfig>,
}

/// Response to `tasks.execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub protocol: String,
    pub root_task_id: String,
    pub task_id: String,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Result of running a tree to quiescence inline.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub status: TaskStatus,
    pub progress: f64,
    pub root_task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// A running root joined with its persisted row.
#[derive(Debug, Clone, Serialize)]
pub struct RunningStatus {
    pub root_task_id: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// The task-execution service.
///
/// Captures immutable registry and hook snapshots at construction and
/// owns the cross-cutting shared state: the running-root tracker, the
/// live-executor map for cancellation, and the in-memory event store
/// behind the SSE surface.
pub struct TaskService {
    sessions: Arc<SessionPool>,
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookSet>,
    tracker: Arc<TaskTracker>,
    live_executors: LiveExecutorMap,
    event_store: Arc<EventStore>,
    protocol: String,
}

impl TaskService {
    pub fn new(
        sessions: Arc<SessionPool>,
        registry: Arc<ExecutorRegistry>,
        hooks: Arc<HookSet>,
    ) -> Arc<Self> {
        Self::with_protocol(sessions, registry, hooks, "jsonrpc")
    }

    /// Construct with an explicit protocol identifier; it is stamped into
    /// webhook payloads and execute responses.
    pub fn with_protocol(
        sessions: Arc<SessionPool>,
        registry: Arc<ExecutorRegistry>,
        hooks: Arc<HookSet>,
        protocol: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            registry,
            hooks,
            tracker: Arc::new(TaskTracker::new()),
            live_executors: Arc::new(Mutex::new(Default::default())),
            event_store: EventStore::new(),
            protocol: protocol.into(),
        })
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.event_store
    }

    pub fn session_pool(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    fn manager(&self, pool: PgPool) -> TaskManager {
        TaskManager::new(pool, Arc::clone(&self.registry), Arc::clone(&self.hooks))
            .with_live_executors(Arc::clone(&self.live_executors))
    }

    fn borrow_session(&self) -> Result<Session> {
        let session = self.sessions.create_session()?;
        Ok(session)
    }

    // -----------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------

    /// Validate and persist a task array; returns the created tree.
    pub async fn create_task_tree(&self, specs: &[TaskSpec]) -> Result<TaskTree, CreateError> {
        let session = self
            .borrow_session()
            .map_err(CreateError::Database)?;
        creator::create_task_tree_from_specs(session.pool(), specs).await
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    /// Create a tree from specs and run it to quiescence.
    pub async fn execute_task_specs(&self, specs: &[TaskSpec]) -> Result<ExecutionSummary> {
        let session = self.borrow_session()?;
        let tree = creator::create_task_tree_from_specs(session.pool(), specs)
            .await
            .map_err(anyhow::Error::from)?;
        let root_id = tree.root().id.clone();
        self.run_tree_inline(session, root_id).await
    }

    /// Run already-persisted tasks to quiescence.
    ///
    /// Every id must exist; a missing id is a hard error listing the
    /// missing ids, never an implicit create.
    pub async fn execute_existing_tasks(&self, task_ids: &[String]) -> Result<ExecutionSummary> {
        if task_ids.is_empty() {
            bail!("no task ids provided");
        }
        let session = self.borrow_session()?;
        let pool = session.pool().clone();

        let mut loaded: Vec<Task> = Vec::with_capacity(task_ids.len());
        let mut missing: Vec<&str> = Vec::new();
        for id in task_ids {
            match repository::get_task_by_id(&pool, id).await? {
                Some(task) => loaded.push(task),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            bail!(
                "tasks not found: {}; existing-task execution never creates tasks",
                missing.join(", ")
            );
        }

        let root = loaded
            .iter()
            .find(|t| t.parent_id.is_none())
            .context("no root task among the provided ids")?;

        self.run_tree_inline(session, root.id.clone()).await
    }

    /// Execute a persisted task (and its subtree) by id, per the
    /// `tasks.execute` contract: non-streaming runs detach into the
    /// background, streaming and webhook runs deliver progress while the
    /// call drives the tree itself.
    pub async fn execute_task_by_id(
        &self,
        task_id: &str,
        options: ExecuteOptions,
    ) -> Result<ExecuteResponse> {
        let session = self.borrow_session()?;
        let pool = session.pool().clone();

        let task = repository::require_task(&pool, task_id).await?;
        let root = repository::get_root_task(&pool, &task).await?;
        let root_task_id = root.id.clone();

        if self.tracker.is_running(&root_task_id) {
            return Ok(ExecuteResponse {
                success: false,
                protocol: self.protocol.clone(),
                root_task_id: root_task_id.clone(),
                task_id: task_id.to_owned(),
                status: "already_running".to_owned(),
                message: format!("Task {root_task_id} is already running"),
                streaming: None,
                events_url: None,
                webhook_url: None,
            });
        }

        if let Some(webhook) = options.webhook.clone() {
            let webhook_url = webhook.url.clone();
            let sink: Arc<dyn EventSink> =
                Arc::new(WebhookSink::new(&self.protocol, &root_task_id, webhook)?);
            self.run_tree_sunk(session, task, root_task_id.clone(), sink)
                .await?;
            return Ok(ExecuteResponse {
                success: true,
                protocol: self.protocol.clone(),
                root_task_id: root_task_id.clone(),
                task_id: task_id.to_owned(),
                status: "started".to_owned(),
                message: format!(
                    "Task {task_id} execution started with webhook callbacks. \
                     Updates will be sent to {webhook_url}"
                ),
                streaming: Some(true),
                events_url: None,
                webhook_url: Some(webhook_url),
            });
        }

        if options.use_streaming {
            let sink: Arc<dyn EventSink> = Arc::new(MemorySink::new(
                root_task_id.clone(),
                Arc::clone(&self.event_store),
            ));
            self.run_tree_sunk(session, task, root_task_id.clone(), sink)
                .await?;
            return Ok(ExecuteResponse {
                success: true,
                protocol: self.protocol.clone(),
                root_task_id: root_task_id.clone(),
                task_id: task_id.to_owned(),
                status: "started".to_owned(),
                message: format!(
                    "Task {task_id} execution started with streaming. \
                     Listen to /events?task_id={root_task_id} for updates."
                ),
                streaming: Some(true),
                events_url: Some(format!("/events?task_id={root_task_id}")),
                webhook_url: None,
            });
        }

        // Non-streaming: detach the run and answer immediately.
        if !self.tracker.start_tracking(&root_task_id) {
            bail!("task {root_task_id} is already running");
        }
        let tracker = Arc::clone(&self.tracker);
        let manager = self.manager(pool.clone());
        let detached_root = root_task_id.clone();
        tokio::spawn(async move {
            let _session = session;
            let result = async {
                let tree = repository::build_task_tree(&pool, &task).await?;
                manager.mark_for_reexecution(&tree);
                manager.distribute_task_tree(&tree).await
            }
            .await;
            tracker.stop_tracking(&detached_root);
            if let Err(e) = result {
                error!(root_task_id = %detached_root, error = %e, "background execution failed");
            }
        });

        Ok(ExecuteResponse {
            success: true,
            protocol: self.protocol.clone(),
            root_task_id: root_task_id.clone(),
            task_id: task_id.to_owned(),
            status: "started".to_owned(),
            message: format!("Task {task_id} execution started"),
            streaming: None,
            events_url: None,
            webhook_url: None,
        })
    }

    /// Drive a tree inline (no sink) and summarize the outcome.
    async fn run_tree_inline(
        &self,
        session: Session,
        root_task_id: String,
    ) -> Result<ExecutionSummary> {
        let pool = session.pool().clone();
        if !self.tracker.start_tracking(&root_task_id) {
            bail!("task {root_task_id} is already running");
        }

        let run = async {
            let root = repository::require_task(&pool, &root_task_id).await?;
            let tree = repository::build_task_tree(&pool, &root).await?;
            let manager = self.manager(pool.clone());
            manager.mark_for_reexecution(&tree);
            manager.distribute_task_tree(&tree).await
        }
        .await;

        self.tracker.stop_tracking(&root_task_id);
        run?;

        let root = repository::require_task(&pool, &root_task_id).await?;
        let tree = repository::build_task_tree(&pool, &root).await?;
        drop(session);

        Ok(ExecutionSummary {
            status: root.status,
            progress: if root.status == TaskStatus::Completed {
                root.progress
            } else {
                tree.aggregate_progress()
            },
            root_task_id,
            result: root.result_value().cloned(),
        })
    }

    /// Drive a subtree with an attached sink, closing it afterwards.
    async fn run_tree_sunk(
        &self,
        session: Session,
        task: Task,
        root_task_id: String,
        sink: Arc<dyn EventSink>,
    ) -> Result<()> {
        let pool = session.pool().clone();
        if !self.tracker.start_tracking(&root_task_id) {
            bail!("task {root_task_id} is already running");
        }

        let run = async {
            let tree = repository::build_task_tree(&pool, &task).await?;
            let manager = self.manager(pool.clone()).with_sink(Arc::clone(&sink));
            manager.mark_for_reexecution(&tree);
            manager.distribute_task_tree_with_streaming(&tree).await
        }
        .await;

        self.tracker.stop_tracking(&root_task_id);
        sink.close().await;
        drop(session);
        run
    }

    // -----------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------

    /// Cancel a batch of tasks; one report per id, in order.
    pub async fn cancel_tasks(
        &self,
        task_ids: &[String],
        error_message: Option<&str>,
    ) -> Result<Vec<CancelReport>> {
        let session = self.borrow_session()?;
        let manager = self.manager(session.pool().clone());

        let mut reports = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let report = manager.cancel_task(task_id, error_message).await;
            if self.tracker.is_running(task_id) {
                self.tracker.stop_tracking(task_id);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    // -----------------------------------------------------------------
    // Copy
    // -----------------------------------------------------------------

    /// Clone a task's minimal enclosing subtree for re-execution.
    pub async fn copy_task(&self, task_id: &str, options: CopyOptions) -> Result<TaskTree> {
        let session = self.borrow_session()?;
        let pool = session.pool();
        let original = repository::require_task(pool, task_id).await?;
        copy::create_task_copy(pool, &original, options).await
    }

    // -----------------------------------------------------------------
    // Queries & mutation passthroughs
    // -----------------------------------------------------------------

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let session = self.borrow_session()?;
        repository::get_task_by_id(session.pool(), task_id).await
    }

    /// Nested tree for a task, walking up to its root first.
    pub async fn get_task_tree(&self, task_id: &str) -> Result<TaskTree> {
        let session = self.borrow_session()?;
        let pool = session.pool();
        let task = repository::require_task(pool, task_id).await?;
        let root = repository::get_root_task(pool, &task).await?;
        repository::build_task_tree(pool, &root).await
    }

    pub async fn list_tasks(&self, filter: &QueryFilter) -> Result<Vec<Task>> {
        let session = self.borrow_session()?;
        repository::query_tasks(session.pool(), filter).await
    }

    pub async fn child_tasks(&self, parent_id: &str) -> Result<Vec<Task>> {
        let session = self.borrow_session()?;
        repository::get_child_tasks_by_parent_id(session.pool(), parent_id).await
    }

    pub async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<Task> {
        let session = self.borrow_session()?;
        repository::update_task_fields(session.pool(), task_id, patch).await
    }

    /// Delete a fully-pending subtree; returns the removed row count.
    pub async fn delete_task(&self, task_id: &str) -> Result<u64> {
        let session = self.borrow_session()?;
        repository::handle_task_delete(session.pool(), task_id).await
    }

    // -----------------------------------------------------------------
    // Running-roots view
    // -----------------------------------------------------------------

    pub fn running_ids(&self) -> Vec<String> {
        self.tracker.running_ids()
    }

    pub fn running_count(&self) -> usize {
        self.tracker.running_count()
    }

    /// Join the in-memory tracker with the persisted rows.
    pub async fn running_status(&self) -> Result<Vec<RunningStatus>> {
        let session = self.borrow_session()?;
        let pool = session.pool();

        let mut statuses = Vec::new();
        for RunningTask {
            root_task_id,
            started_at,
        } in self.tracker.snapshot()
        {
            if let Some(task) = repository::get_task_by_id(pool, &root_task_id).await? {
                statuses.push(RunningStatus {
                    root_task_id,
                    status: task.status,
                    progress: task.progress,
                    started_at,
                });
            }
        }
        Ok(statuses)
    }

    /// Buffered streaming events for a root task (the SSE surface).
    pub fn streaming_events(&self, root_task_id: &str) -> Vec<ProgressEvent> {
        self.event_store.events_for(root_task_id)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

impl std::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskService")
            .field("protocol", &self.protocol)
            .field("running", &self.tracker.running_count())
            .finish()
    }
}
