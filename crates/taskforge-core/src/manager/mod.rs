//! The scheduler: dependency- and priority-aware execution of a task
//! tree, with hooks, cancellation checkpoints, and progress streaming.
//!
//! Scheduling is recursive and bottom-up within each subtree. Within one
//! priority bucket every dependency-ready task runs concurrently; tasks
//! whose dependencies are not yet satisfied are deferred and picked up by
//! the post-completion fan-out of whichever task satisfies their last
//! dependency.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use serde_json::{Value, json};
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use taskforge_db::models::{JsonMap, Task, TaskStatus};
use taskforge_db::repository::{self, StatusUpdate};
use taskforge_db::tree::TaskTree;

use crate::executor::{CancellationChecker, Executor, ExecutorContext, ExecutorRegistry};
use crate::hooks::HookSet;
use crate::streaming::{EventSink, ProgressEvent};

/// Shared map from task id to the live executor instance of its
/// in-flight execution, kept so an out-of-band cancel can reach it.
pub type LiveExecutorMap = Arc<Mutex<HashMap<String, Arc<dyn Executor>>>>;

/// Outcome of a cancellation request, returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CancelReport {
    pub task_id: String,
    /// `"cancelled"` on success, `"failed"` when the request was refused.
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CancelReport {
    fn refused(task_id: &str, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.to_owned(),
            status: "failed".to_owned(),
            message: message.into(),
            current_status: None,
            token_usage: None,
            result: None,
            error: None,
        }
    }
}

/// The task-tree scheduler.
///
/// One manager drives one tree execution over one borrowed session's
/// `PgPool`. Hook and registry snapshots are captured at construction;
/// the live-executor map is shared with the facade so cancellation can
/// reach executors started by any manager.
pub struct TaskManager {
    pool: PgPool,
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookSet>,
    live_executors: LiveExecutorMap,
    sink: Option<Arc<dyn EventSink>>,
    reexecute: Mutex<HashSet<String>>,
}

impl TaskManager {
    pub fn new(pool: PgPool, registry: Arc<ExecutorRegistry>, hooks: Arc<HookSet>) -> Self {
        Self {
            pool,
            registry,
            hooks,
            live_executors: Arc::new(Mutex::new(HashMap::new())),
            sink: None,
            reexecute: Mutex::new(HashSet::new()),
        }
    }

    /// Share the live-executor map with the facade.
    pub fn with_live_executors(mut self, map: LiveExecutorMap) -> Self {
        self.live_executors = map;
        self
    }

    /// Attach a streaming sink; events are emitted for every transition.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    // -----------------------------------------------------------------
    // Re-execution marking
    // -----------------------------------------------------------------

    /// Mark every `failed` or `completed` node of the tree as eligible for
    /// re-execution; the scheduler then treats them as `pending` for this
    /// run. Returns how many nodes were marked.
    pub fn mark_for_reexecution(&self, tree: &TaskTree) -> usize {
        let mut marked = self.reexecute.lock().expect("reexecute lock poisoned");
        let mut count = 0;
        for task in tree.tasks() {
            if matches!(task.status, TaskStatus::Failed | TaskStatus::Completed)
                && marked.insert(task.id.clone())
            {
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "marked tasks for re-execution");
        }
        count
    }

    fn effective_status(&self, task: &Task) -> TaskStatus {
        if matches!(task.status, TaskStatus::Failed | TaskStatus::Completed)
            && self
                .reexecute
                .lock()
                .expect("reexecute lock poisoned")
                .contains(&task.id)
        {
            TaskStatus::Pending
        } else {
            task.status
        }
    }

    fn unmark_reexecution(&self, task_id: &str) {
        self.reexecute
            .lock()
            .expect("reexecute lock poisoned")
            .remove(task_id);
    }

    // -----------------------------------------------------------------
    // Tree distribution
    // -----------------------------------------------------------------

    /// Execute a task tree to quiescence.
    pub async fn distribute_task_tree(&self, tree: &TaskTree) -> Result<()> {
        info!(root_id = %tree.root().id, "distributing task tree");
        self.execute_node(tree.root().id.clone()).await
    }

    /// Execute a task tree with progress streaming: an initial progress
    /// event, per-task events during the run, and a terminal event
    /// reflecting the tree's aggregate outcome.
    pub async fn distribute_task_tree_with_streaming(&self, tree: &TaskTree) -> Result<()> {
        let root_id = tree.root().id.clone();
        info!(root_id = %root_id, "distributing task tree with streaming");

        self.emit(ProgressEvent::progress(
            &root_id,
            0.0,
            "Task tree execution started",
        ))
        .await;

        if let Err(e) = self.execute_node(root_id.clone()).await {
            error!(root_id = %root_id, error = %e, "task tree execution failed");
            self.emit(ProgressEvent::task_failed(&root_id, e.to_string()))
                .await;
            return Err(e);
        }

        let root = repository::require_task(&self.pool, &root_id).await?;
        let fresh = repository::build_task_tree(&self.pool, &root).await?;
        let status = fresh.aggregate_status();
        let progress = fresh.aggregate_progress();

        if status == TaskStatus::Completed {
            self.emit(ProgressEvent::final_event(
                &root_id,
                "completed",
                Some(json!({ "progress": progress })),
            ))
            .await;
        } else {
            self.emit(ProgressEvent::progress(
                &root_id,
                progress,
                format!("Task tree execution {status}"),
            ))
            .await;
        }

        Ok(())
    }

    /// Recursive scheduling step for the subtree rooted at `task_id`.
    fn execute_node<'a>(&'a self, task_id: String) -> BoxFuture<'a, Result<()>> {
        async move {
            let Some(task) = repository::get_task_by_id(&self.pool, &task_id).await? else {
                bail!("task {task_id} not found");
            };

            let status = self.effective_status(&task);
            if matches!(
                status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::InProgress
            ) {
                debug!(task_id = %task_id, %status, "task already settled, skipping distribution");
                return Ok(());
            }

            let tree = repository::build_task_tree(&self.pool, &task).await?;
            let node = tree.root_index();

            // A node whose children have all reached a terminal state (or
            // that has none) runs itself.
            let children_settled = tree.children(node).iter().all(|&c| {
                matches!(
                    self.effective_status(tree.task(c)),
                    TaskStatus::Completed | TaskStatus::Failed
                )
            });
            if children_settled {
                if status != TaskStatus::Completed {
                    self.execute_single_task(task_id.clone()).await?;
                }
                return Ok(());
            }

            // Bucket all unfinished descendants by priority; smaller
            // integers run first.
            let mut buckets: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
            for idx in tree.subtree_indices(node) {
                if idx == node {
                    continue;
                }
                let descendant = tree.task(idx);
                if matches!(
                    self.effective_status(descendant),
                    TaskStatus::Completed | TaskStatus::Failed
                ) {
                    continue;
                }
                buckets
                    .entry(descendant.effective_priority())
                    .or_default()
                    .push(idx);
            }

            if buckets.is_empty() {
                debug!(task_id = %task_id, "no descendants left to schedule");
                return Ok(());
            }

            let mut any_ready = false;
            for (priority, bucket) in &buckets {
                let mut ready: Vec<String> = Vec::new();
                let mut waiting = 0usize;
                for &idx in bucket {
                    let candidate = tree.task(idx);
                    if self.is_dispatch_ready(candidate).await? {
                        ready.push(candidate.id.clone());
                    } else {
                        waiting += 1;
                    }
                }

                debug!(
                    priority,
                    ready = ready.len(),
                    waiting,
                    "processing priority bucket"
                );

                if ready.is_empty() {
                    continue;
                }
                any_ready = true;

                // Fan out: every ready task in the bucket starts
                // concurrently; each one's subtree is recursed after the
                // task itself settles.
                let jobs = ready.into_iter().map(|id| async move {
                    if let Err(e) = self.execute_single_task(id.clone()).await {
                        error!(task_id = %id, error = %e, "error executing task");
                    }
                    if let Err(e) = self.execute_node(id.clone()).await {
                        error!(task_id = %id, error = %e, "error distributing subtree");
                    }
                });
                join_all(jobs).await;
            }

            if !any_ready && self.descendants_blocked_on(&tree, node).await? {
                // Every unfinished descendant is dependency-blocked and at
                // least one of the chains terminates at this node: the
                // hierarchy/dependency knot only unties by running the
                // node now, so its completion fan-out releases the
                // waiters.
                debug!(task_id = %task_id, "descendants all waiting on this node, executing it");
                self.execute_single_task(task_id.clone()).await?;
            }

            Ok(())
        }
        .boxed()
    }

    /// True when some unfinished descendant's unsatisfied required
    /// dependency points at the node itself.
    async fn descendants_blocked_on(&self, tree: &TaskTree, node: usize) -> Result<bool> {
        let node_id = &tree.task(node).id;
        let completed = self.completed_tasks_by_id(tree.task(node)).await?;
        for idx in tree.subtree_indices(node) {
            if idx == node {
                continue;
            }
            let descendant = tree.task(idx);
            if matches!(
                self.effective_status(descendant),
                TaskStatus::Completed | TaskStatus::Failed
            ) {
                continue;
            }
            let blocked_on_node = descendant
                .dependency_list()
                .iter()
                .any(|dep| dep.required() && !completed.contains_key(dep.id()) && dep.id() == node_id);
            if blocked_on_node {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // -----------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------

    /// A task is dispatch-ready when its required dependencies are all
    /// completed and none of its children is still unfinished.
    async fn is_dispatch_ready(&self, task: &Task) -> Result<bool> {
        let children = repository::get_child_tasks_by_parent_id(&self.pool, &task.id).await?;
        let children_settled = children.iter().all(|c| {
            matches!(
                self.effective_status(c),
                TaskStatus::Completed | TaskStatus::Failed
            )
        });
        if !children_settled {
            return Ok(false);
        }
        self.are_dependencies_satisfied(task).await
    }

    /// Dependency readiness: every required dependency must be a
    /// completed task in the same root tree.
    async fn are_dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        let deps = task.dependency_list();
        if deps.is_empty() {
            return Ok(true);
        }

        let completed = self.completed_tasks_by_id(task).await?;
        for dep in deps {
            if dep.required() && !completed.contains_key(dep.id()) {
                debug!(
                    task_id = %task.id,
                    dependency = dep.id(),
                    "required dependency not completed yet"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Completed tasks in the same root tree, keyed by id.
    async fn completed_tasks_by_id(&self, task: &Task) -> Result<HashMap<String, Task>> {
        let root = repository::get_root_task(&self.pool, task).await?;
        let all = repository::get_all_tasks_in_tree(&self.pool, &root).await?;
        Ok(all
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| (t.id.clone(), t))
            .collect())
    }

    // -----------------------------------------------------------------
    // Dependency result resolution
    // -----------------------------------------------------------------

    /// Merge dependency results into the task's inputs.
    ///
    /// For record dependencies with mapping results: unwrap a nested
    /// `result` sub-mapping, then either project the fields declared by
    /// `schemas.input_schema.properties` or nest the full result under
    /// the dependency id. Bare-string dependencies merge mapping results
    /// wholesale.
    async fn resolve_task_dependencies(&self, task: &Task) -> Result<JsonMap> {
        let mut inputs = task.inputs_map();
        let deps = task.dependency_list();
        if deps.is_empty() {
            return Ok(inputs);
        }

        let completed = self.completed_tasks_by_id(task).await?;
        let schema_properties = task
            .schemas_map()
            .get("input_schema")
            .and_then(|schema| schema.get("properties"))
            .and_then(Value::as_object)
            .cloned();

        for dep in deps {
            let Some(source) = completed.get(dep.id()) else {
                if dep.required() {
                    warn!(
                        task_id = %task.id,
                        dependency = dep.id(),
                        "required dependency has no completed task, skipping"
                    );
                }
                continue;
            };
            let Some(result) = source.result_value() else {
                if dep.required() {
                    warn!(
                        task_id = %task.id,
                        dependency = dep.id(),
                        "dependency completed without a result"
                    );
                }
                continue;
            };

            if dep.is_bare() {
                match result {
                    Value::Object(map) => inputs.extend(map.clone()),
                    other => {
                        inputs.insert(dep.id().to_owned(), other.clone());
                    }
                }
                continue;
            }

            match result {
                Value::Object(map) => {
                    // A mapping result may nest the payload under `result`.
                    let actual: &JsonMap = match map.get("result") {
                        Some(Value::Object(inner)) => inner,
                        _ => map,
                    };

                    if let Some(properties) = &schema_properties {
                        // Field-projection mode: copy only declared keys.
                        for key in properties.keys() {
                            if let Some(value) = actual.get(key) {
                                inputs.insert(key.clone(), value.clone());
                            }
                        }
                    } else {
                        // Nested-by-id mode.
                        inputs.insert(dep.id().to_owned(), result.clone());
                    }
                }
                other => {
                    inputs.insert(dep.id().to_owned(), other.clone());
                }
            }
        }

        Ok(inputs)
    }

    // -----------------------------------------------------------------
    // Single-task execution
    // -----------------------------------------------------------------

    /// Run one task through the full execution protocol. Errors are
    /// absorbed: the task is marked failed and siblings keep running.
    fn execute_single_task<'a>(&'a self, task_id: String) -> BoxFuture<'a, Result<()>> {
        async move {
            if let Err(e) = self.run_task_protocol(&task_id).await {
                error!(task_id = %task_id, error = %e, "task execution failed");
                self.remove_live_executor(&task_id);
                let update = StatusUpdate::to(TaskStatus::Failed)
                    .error(Some(e.to_string()))
                    .completed_at(Utc::now());
                if let Err(db_err) =
                    repository::update_task_status(&self.pool, &task_id, update).await
                {
                    error!(task_id = %task_id, error = %db_err, "failed to record task failure");
                }
                self.emit(ProgressEvent::task_failed(&task_id, e.to_string()))
                    .await;

                // Independent branches keep going: a parent whose children
                // just all settled must still be dispatched even though
                // this task will never complete.
                if let Ok(Some(failed)) = repository::get_task_by_id(&self.pool, &task_id).await {
                    if let Err(sweep_err) = self.dispatch_ready_tasks(&failed).await {
                        error!(
                            task_id = %task_id,
                            error = %sweep_err,
                            "error dispatching tasks after failure"
                        );
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// The per-task execution protocol proper; any error marks the task
    /// failed in [`Self::execute_single_task`].
    async fn run_task_protocol(&self, task_id: &str) -> Result<()> {
        // Guard: refresh from storage and bow out if settled elsewhere.
        let Some(task) = repository::get_task_by_id(&self.pool, task_id).await? else {
            bail!("task {task_id} not found");
        };
        if task.status == TaskStatus::Cancelled {
            info!(task_id, "task already cancelled, skipping execution");
            return Ok(());
        }
        let status = self.effective_status(&task);
        if matches!(
            status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::InProgress
        ) {
            debug!(task_id, %status, "task already settled, skipping execution");
            return Ok(());
        }
        if !self.are_dependencies_satisfied(&task).await? {
            debug!(task_id, "dependencies not satisfied, leaving task pending");
            return Ok(());
        }

        // Claim the task: exactly one of two racing workers transitions
        // it to in_progress; the loser bows out silently.
        self.emit(ProgressEvent::task_start(task_id)).await;
        if !repository::try_claim_task(&self.pool, task_id, task.status, Utc::now()).await? {
            debug!(task_id, "lost the claim race, another worker owns this task");
            return Ok(());
        }
        self.unmark_reexecution(task_id);

        let task = repository::require_task(&self.pool, task_id).await?;
        if task.status == TaskStatus::Cancelled {
            info!(task_id, "task cancelled after start, stopping");
            return Ok(());
        }

        // Dependency resolution.
        let resolved = self.resolve_task_dependencies(&task).await?;
        let task = repository::require_task(&self.pool, task_id).await?;
        if task.status == TaskStatus::Cancelled {
            info!(task_id, "task cancelled during dependency resolution, stopping");
            return Ok(());
        }
        let task = if resolved != task.inputs_map() {
            repository::update_task_inputs(&self.pool, task_id, &resolved).await?;
            let refreshed = repository::require_task(&self.pool, task_id).await?;
            if refreshed.status == TaskStatus::Cancelled {
                info!(task_id, "task cancelled after input update, stopping");
                return Ok(());
            }
            refreshed
        } else {
            task
        };

        // Pre-hooks run after dependency resolution so they see the
        // complete payload; a deep comparison decides whether to persist.
        let mut inputs = task.inputs_map();
        let before_hooks = inputs.clone();
        self.hooks.run_pre_hooks(&task, &mut inputs).await;
        let task = if inputs != before_hooks {
            info!(task_id, "pre-hooks modified inputs, persisting");
            repository::update_task_inputs(&self.pool, task_id, &inputs).await?;
            repository::require_task(&self.pool, task_id).await?
        } else {
            task
        };
        if task.status == TaskStatus::Cancelled {
            info!(task_id, "task cancelled before executor dispatch, stopping");
            return Ok(());
        }

        // Executor dispatch.
        let final_inputs = task.inputs_map();
        let params = task.params_map();
        let schemas = task.schemas_map();

        let factory = self.registry.resolve(&params, &schemas)?;
        debug!(task_id, executor_id = factory.id(), "dispatching to executor");

        let mut options = params.clone();
        options.remove("executor_id");
        let context = ExecutorContext {
            inputs: final_inputs.clone(),
            options,
            input_schema: schemas.get("input_schema").cloned(),
            cancellation: CancellationChecker::snapshot(task.status == TaskStatus::Cancelled),
        };
        let executor = factory.build(context)?;

        if executor.cancelable() {
            self.live_executors
                .lock()
                .expect("live executor lock poisoned")
                .insert(task_id.to_owned(), Arc::clone(&executor));
        }

        let execution = executor.execute(&final_inputs).await;

        // Post-execution cancellation check: a cancel that landed while
        // the executor ran wins over its return value.
        let refreshed = repository::get_task_by_id(&self.pool, task_id).await?;
        if let Some(current) = &refreshed {
            if current.status == TaskStatus::Cancelled {
                info!(task_id, "task cancelled during execution, preserving cancelled status");
                self.remove_live_executor(task_id);
                let supports_cancel = self
                    .sink
                    .as_ref()
                    .is_none_or(|s| s.supports_cancel_events());
                if supports_cancel {
                    self.emit(ProgressEvent::task_cancelled(task_id)).await;
                } else {
                    self.emit(ProgressEvent::task_failed(task_id, "Task was cancelled"))
                        .await;
                }
                return Ok(());
            }
        }
        self.remove_live_executor(task_id);

        let result_value = execution?;

        // Commit.
        repository::update_task_status(
            &self.pool,
            task_id,
            StatusUpdate::to(TaskStatus::Completed)
                .progress(1.0)
                .result(result_value.clone())
                .completed_at(Utc::now()),
        )
        .await?;
        let completed = repository::require_task(&self.pool, task_id).await?;
        self.emit(ProgressEvent::task_completed(
            task_id,
            Some(result_value),
        ))
        .await;

        // Propagate: post-hooks first, then dependent dispatch. Failures
        // here never re-open the completed task.
        if let Err(e) = self.execute_after_task(&completed).await {
            error!(task_id, error = %e, "error triggering dependent tasks");
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Post-completion fan-out
    // -----------------------------------------------------------------

    /// After `completed_task` reached `completed`: run post-hooks, then
    /// re-evaluate every pending task in the root tree and dispatch the
    /// ones whose dependencies are now satisfied.
    pub async fn execute_after_task(&self, completed_task: &Task) -> Result<()> {
        let Some(task) = repository::get_task_by_id(&self.pool, &completed_task.id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::Completed {
            return Ok(());
        }

        // Post-hooks before dependent dispatch so notification sinks see
        // completion promptly.
        let inputs = task.inputs_map();
        let result = task.result_value().cloned().unwrap_or(Value::Null);
        self.hooks.run_post_hooks(&task, &inputs, &result).await;

        self.dispatch_ready_tasks(&task).await
    }

    /// Sweep the root tree of `origin` for pending tasks whose
    /// dependencies are satisfied and whose children are settled, and
    /// dispatch them. Failures in dispatched tasks never propagate back.
    async fn dispatch_ready_tasks(&self, origin: &Task) -> Result<()> {
        let root = repository::get_root_task(&self.pool, origin).await?;
        let all = repository::get_all_tasks_in_tree(&self.pool, &root).await?;

        let settled: HashMap<&str, TaskStatus> = all
            .iter()
            .map(|t| (t.id.as_str(), self.effective_status(t)))
            .collect();

        for candidate in &all {
            if candidate.id == origin.id {
                continue;
            }
            if self.effective_status(candidate) != TaskStatus::Pending {
                continue;
            }

            // A pending parent only becomes dispatchable once its children
            // are all settled.
            let children_settled = all
                .iter()
                .filter(|t| t.parent_id.as_deref() == Some(candidate.id.as_str()))
                .all(|t| {
                    matches!(
                        settled.get(t.id.as_str()),
                        Some(TaskStatus::Completed | TaskStatus::Failed)
                    )
                });
            if !children_settled {
                continue;
            }

            if self.are_dependencies_satisfied(candidate).await? {
                info!(
                    task_id = %candidate.id,
                    name = %candidate.name,
                    "dependencies now satisfied, dispatching"
                );
                if let Err(e) = self.execute_single_task(candidate.id.clone()).await {
                    error!(task_id = %candidate.id, error = %e, "failed to dispatch dependent task");
                }
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------

    /// Cancel a task out-of-band.
    ///
    /// Refused (status `"failed"` in the report) when the task does not
    /// exist or is already terminal. A cancelable live executor is asked
    /// to stop and may contribute token usage and a partial result, both
    /// folded into the persisted row.
    pub async fn cancel_task(&self, task_id: &str, error_message: Option<&str>) -> CancelReport {
        match self.cancel_task_inner(task_id, error_message).await {
            Ok(report) => report,
            Err(e) => {
                error!(task_id, error = %e, "error cancelling task");
                let mut report =
                    CancelReport::refused(task_id, format!("Failed to cancel task {task_id}"));
                report.error = Some(e.to_string());
                report
            }
        }
    }

    async fn cancel_task_inner(
        &self,
        task_id: &str,
        error_message: Option<&str>,
    ) -> Result<CancelReport> {
        let Some(task) = repository::get_task_by_id(&self.pool, task_id).await? else {
            let mut report = CancelReport::refused(task_id, format!("Task {task_id} not found"));
            report.error = Some("task not found".to_owned());
            return Ok(report);
        };

        if task.status.is_terminal() {
            let mut report = CancelReport::refused(
                task_id,
                format!("Task {task_id} is already {}, cannot cancel", task.status),
            );
            report.current_status = Some(task.status);
            return Ok(report);
        }

        info!(task_id, current_status = %task.status, "cancelling task");

        let mut token_usage: Option<Value> = None;
        let mut partial_result: Option<Value> = None;

        if task.status == TaskStatus::InProgress {
            let executor = self
                .live_executors
                .lock()
                .expect("live executor lock poisoned")
                .get(task_id)
                .cloned();
            if let Some(executor) = executor {
                if executor.cancelable() {
                    info!(task_id, "asking live executor to cancel");
                    if let Some(outcome) = executor.cancel().await {
                        token_usage = outcome.token_usage;
                        partial_result = outcome.partial_result;
                    }
                }
            }
        }

        let message = error_message
            .map(str::to_owned)
            .unwrap_or_else(|| "Cancelled by user".to_owned());

        // Fold the executor's contribution into the persisted result.
        let folded_result = match (&partial_result, &token_usage) {
            (Some(Value::Object(map)), Some(usage)) => {
                let mut merged = map.clone();
                merged.insert("token_usage".to_owned(), usage.clone());
                Some(Value::Object(merged))
            }
            (Some(partial), None) => Some(partial.clone()),
            (_, Some(usage)) => Some(json!({ "token_usage": usage })),
            (None, None) => None,
        };

        let mut update = StatusUpdate::to(TaskStatus::Cancelled)
            .error(Some(message.clone()))
            .completed_at(Utc::now());
        if let Some(result) = &folded_result {
            update = update.result(result.clone());
        }
        repository::update_task_status(&self.pool, task_id, update).await?;

        self.remove_live_executor(task_id);

        info!(task_id, "task cancelled");
        Ok(CancelReport {
            task_id: task_id.to_owned(),
            status: "cancelled".to_owned(),
            message,
            current_status: None,
            token_usage,
            result: partial_result,
            error: None,
        })
    }

    fn remove_live_executor(&self, task_id: &str) {
        self.live_executors
            .lock()
            .expect("live executor lock poisoned")
            .remove(task_id);
    }

    // -----------------------------------------------------------------
    // Event emission
    // -----------------------------------------------------------------

    async fn emit(&self, event: ProgressEvent) {
        if let Some(sink) = &self.sink {
            sink.put(event).await;
        }
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("streaming", &self.sink.is_some())
            .finish()
    }
}
