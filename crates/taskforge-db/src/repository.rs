//! Database operations for the `tasks` table.
//!
//! Free async functions over a `&PgPool`, the persistence contract the
//! engine relies on. Callers executing a task tree route every call here
//! through the `PgPool` of one leased [`crate::session::Session`].

use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, QueryBuilder};
use uuid::Uuid;

use crate::models::{JsonMap, StoredDependency, Task, TaskStatus};
use crate::tree::TaskTree;

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

/// Fields for a new task row. Omitted id means a generated UUID.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: Option<String>,
    pub name: String,
    pub user_id: Option<String>,
    pub parent_id: Option<String>,
    pub original_task_id: Option<String>,
    pub priority: Option<i32>,
    pub dependencies: Option<Vec<StoredDependency>>,
    pub inputs: Option<JsonMap>,
    pub params: Option<JsonMap>,
    pub schemas: Option<JsonMap>,
}

impl NewTask {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Insert a new task row in status `pending` with progress 0.
///
/// Returns the inserted row with server-generated defaults applied.
pub async fn create_task(pool: &PgPool, new: NewTask) -> Result<Task> {
    let id = new
        .id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, parent_id, original_task_id, user_id, name, priority, \
                            dependencies, inputs, params, schemas) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING *",
    )
    .bind(&id)
    .bind(&new.parent_id)
    .bind(&new.original_task_id)
    .bind(&new.user_id)
    .bind(&new.name)
    .bind(new.priority)
    .bind(new.dependencies.map(Json))
    .bind(new.inputs.map(Json))
    .bind(new.params.map(Json))
    .bind(new.schemas.map(Json))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert task {id}"))?;

    Ok(task)
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Fetch a single task by id.
pub async fn get_task_by_id(pool: &PgPool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task that must exist.
pub async fn require_task(pool: &PgPool, id: &str) -> Result<Task> {
    get_task_by_id(pool, id)
        .await?
        .with_context(|| format!("task {id} not found"))
}

/// Walk `parent_id` upward to the root of the task's tree.
pub async fn get_root_task(pool: &PgPool, task: &Task) -> Result<Task> {
    let mut current = task.clone();
    while let Some(parent_id) = current.parent_id.clone() {
        current = get_task_by_id(pool, &parent_id)
            .await?
            .with_context(|| {
                format!("task {} references missing parent {parent_id}", current.id)
            })?;
    }
    Ok(current)
}

/// Collect a task and all of its descendants, breadth-first.
pub async fn get_all_tasks_in_tree(pool: &PgPool, start: &Task) -> Result<Vec<Task>> {
    let mut collected = vec![start.clone()];
    let mut frontier = vec![start.id.clone()];

    while !frontier.is_empty() {
        let batch = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE parent_id = ANY($1) ORDER BY created_at ASC",
        )
        .bind(&frontier)
        .fetch_all(pool)
        .await
        .context("failed to fetch child tasks")?;

        frontier = batch.iter().map(|t| t.id.clone()).collect();
        collected.extend(batch);
    }

    Ok(collected)
}

/// Direct children of a task, in creation order.
pub async fn get_child_tasks_by_parent_id(pool: &PgPool, parent_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE parent_id = $1 ORDER BY created_at ASC",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch child tasks")?;

    Ok(tasks)
}

/// Read the subtree rooted at `task` once and assemble the in-memory tree.
pub async fn build_task_tree(pool: &PgPool, task: &Task) -> Result<TaskTree> {
    let tasks = get_all_tasks_in_tree(pool, task).await?;
    let tree = TaskTree::from_tasks_with_root(&task.id, tasks)
        .with_context(|| format!("failed to assemble tree rooted at {}", task.id))?;
    Ok(tree)
}

// ---------------------------------------------------------------------------
// List query
// ---------------------------------------------------------------------------

/// Sentinel `parent_id` filter value meaning "root tasks only".
pub const ROOT_TASKS_ONLY: &str = "";

/// Whitelisted sort columns for [`query_tasks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    Name,
    Status,
}

impl OrderBy {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Priority => "priority",
            Self::Name => "name",
            Self::Status => "status",
        }
    }
}

/// Filter for [`query_tasks`].
#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
    /// `None` = no parent filter; [`ROOT_TASKS_ONLY`] = roots only;
    /// anything else filters on that parent id.
    pub parent_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub order_by: OrderBy,
    pub order_desc: bool,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            status: None,
            parent_id: None,
            limit: 100,
            offset: 0,
            order_by: OrderBy::default(),
            order_desc: false,
        }
    }
}

/// List tasks matching the filter.
pub async fn query_tasks(pool: &PgPool, filter: &QueryFilter) -> Result<Vec<Task>> {
    let mut qb = QueryBuilder::new("SELECT * FROM tasks WHERE status <> 'deleted'");

    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ");
        qb.push_bind(user_id);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ");
        qb.push_bind(status);
    }
    match filter.parent_id.as_deref() {
        None => {}
        Some(ROOT_TASKS_ONLY) => {
            qb.push(" AND parent_id IS NULL");
        }
        Some(parent_id) => {
            qb.push(" AND parent_id = ");
            qb.push_bind(parent_id.to_owned());
        }
    }

    qb.push(" ORDER BY ");
    qb.push(filter.order_by.column());
    qb.push(if filter.order_desc { " DESC" } else { " ASC" });
    qb.push(" LIMIT ");
    qb.push_bind(filter.limit);
    qb.push(" OFFSET ");
    qb.push_bind(filter.offset);

    let tasks = qb
        .build_query_as::<Task>()
        .fetch_all(pool)
        .await
        .context("failed to query tasks")?;

    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Status write with optional companion fields.
///
/// Absent fields are left untouched. `error` uses a double option so a
/// transition can explicitly clear a previous error (`Some(None)`).
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub error: Option<Option<String>>,
    pub result: Option<serde_json::Value>,
    pub progress: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            error: None,
            result: None,
            progress: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Single atomic status write; fields not carried by the update are not
/// changed. `updated_at` is always refreshed.
pub async fn update_task_status(pool: &PgPool, task_id: &str, update: StatusUpdate) -> Result<()> {
    let mut qb = QueryBuilder::new("UPDATE tasks SET status = ");
    qb.push_bind(update.status);
    qb.push(", updated_at = NOW()");

    if let Some(error) = update.error {
        qb.push(", error = ");
        qb.push_bind(error);
    }
    if let Some(result) = update.result {
        qb.push(", result = ");
        qb.push_bind(Json(result));
    }
    if let Some(progress) = update.progress {
        qb.push(", progress = ");
        qb.push_bind(progress);
    }
    if let Some(started_at) = update.started_at {
        qb.push(", started_at = ");
        qb.push_bind(started_at);
    }
    if let Some(completed_at) = update.completed_at {
        qb.push(", completed_at = ");
        qb.push_bind(completed_at);
    }

    qb.push(" WHERE id = ");
    qb.push_bind(task_id.to_owned());

    let result = qb
        .build()
        .execute(pool)
        .await
        .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        bail!("task {task_id} not found");
    }

    Ok(())
}

/// Atomically claim a task for execution: transition it to `in_progress`
/// only if its status still matches what the scheduler observed.
///
/// Optimistic locking -- the UPDATE's WHERE clause includes the expected
/// status, so of two workers racing for the same task exactly one wins.
/// Returns false when the claim was lost.
pub async fn try_claim_task(
    pool: &PgPool,
    task_id: &str,
    expected: TaskStatus,
    started_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'in_progress', started_at = $1, error = NULL, updated_at = NOW() \
         WHERE id = $2 AND status = $3",
    )
    .bind(started_at)
    .bind(task_id)
    .bind(expected)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected() > 0)
}

/// Replace the `inputs` map.
pub async fn update_task_inputs(pool: &PgPool, task_id: &str, inputs: &JsonMap) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET inputs = $1, updated_at = NOW() WHERE id = $2")
        .bind(Json(inputs))
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to update task inputs")?;

    if result.rows_affected() == 0 {
        bail!("task {task_id} not found");
    }

    Ok(())
}

/// Writable-field patch for the `tasks.update` operation.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub error: Option<Option<String>>,
    pub result: Option<serde_json::Value>,
    pub progress: Option<f64>,
    pub inputs: Option<JsonMap>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.error.is_none()
            && self.result.is_none()
            && self.progress.is_none()
            && self.inputs.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
    }
}

/// Apply a partial update to the writable task fields.
pub async fn update_task_fields(pool: &PgPool, task_id: &str, patch: TaskPatch) -> Result<Task> {
    if patch.is_empty() {
        return require_task(pool, task_id).await;
    }

    let mut qb = QueryBuilder::new("UPDATE tasks SET updated_at = NOW()");

    if let Some(status) = patch.status {
        qb.push(", status = ");
        qb.push_bind(status);
    }
    if let Some(error) = patch.error {
        qb.push(", error = ");
        qb.push_bind(error);
    }
    if let Some(result) = patch.result {
        qb.push(", result = ");
        qb.push_bind(Json(result));
    }
    if let Some(progress) = patch.progress {
        qb.push(", progress = ");
        qb.push_bind(progress);
    }
    if let Some(inputs) = patch.inputs {
        qb.push(", inputs = ");
        qb.push_bind(Json(inputs));
    }
    if let Some(started_at) = patch.started_at {
        qb.push(", started_at = ");
        qb.push_bind(started_at);
    }
    if let Some(completed_at) = patch.completed_at {
        qb.push(", completed_at = ");
        qb.push_bind(completed_at);
    }

    qb.push(" WHERE id = ");
    qb.push_bind(task_id.to_owned());
    qb.push(" RETURNING *");

    let task = qb
        .build_query_as::<Task>()
        .fetch_optional(pool)
        .await
        .context("failed to update task fields")?
        .with_context(|| format!("task {task_id} not found"))?;

    Ok(task)
}

/// Point a task at its parent. Used by the creator's second pass and the
/// copy engine's linking pass.
pub async fn set_parent(pool: &PgPool, task_id: &str, parent_id: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE tasks SET parent_id = $1, updated_at = NOW() WHERE id = $2")
        .bind(parent_id)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task parent")?;
    Ok(())
}

/// Maintain the derived `has_children` flag.
pub async fn set_has_children(pool: &PgPool, task_id: &str, has_children: bool) -> Result<()> {
    sqlx::query("UPDATE tasks SET has_children = $1, updated_at = NOW() WHERE id = $2")
        .bind(has_children)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set has_children")?;
    Ok(())
}

/// Rewrite the dependency list (already normalized to persisted ids).
pub async fn set_dependencies(
    pool: &PgPool,
    task_id: &str,
    dependencies: &[StoredDependency],
) -> Result<()> {
    let value = if dependencies.is_empty() {
        None
    } else {
        Some(Json(dependencies.to_vec()))
    };
    sqlx::query("UPDATE tasks SET dependencies = $1, updated_at = NOW() WHERE id = $2")
        .bind(value)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task dependencies")?;
    Ok(())
}

/// Mark a task as having at least one copy.
pub async fn set_has_copy(pool: &PgPool, task_id: &str, has_copy: bool) -> Result<()> {
    sqlx::query("UPDATE tasks SET has_copy = $1, updated_at = NOW() WHERE id = $2")
        .bind(has_copy)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set has_copy")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Delete a task and its whole subtree.
///
/// Refused unless the subject and every descendant are `pending` and no
/// task outside the subtree depends on a member of it. Returns the number
/// of physically removed rows.
pub async fn handle_task_delete(pool: &PgPool, task_id: &str) -> Result<u64> {
    let task = require_task(pool, task_id).await?;

    let subtree = get_all_tasks_in_tree(pool, &task).await?;
    for member in &subtree {
        if member.status != TaskStatus::Pending {
            bail!(
                "cannot delete task {task_id}: task {} has status {}, \
                 only fully pending subtrees can be deleted",
                member.id,
                member.status
            );
        }
    }

    let member_ids: HashSet<&str> = subtree.iter().map(|t| t.id.as_str()).collect();

    // No task outside the subtree may depend on a member.
    let root = get_root_task(pool, &task).await?;
    let tree_tasks = get_all_tasks_in_tree(pool, &root).await?;
    for other in &tree_tasks {
        if member_ids.contains(other.id.as_str()) {
            continue;
        }
        for dep in other.dependency_list() {
            if member_ids.contains(dep.id()) {
                bail!(
                    "cannot delete task {task_id}: task {} depends on {} inside the subtree",
                    other.id,
                    dep.id()
                );
            }
        }
    }

    let ids: Vec<String> = subtree.iter().map(|t| t.id.clone()).collect();
    let result = sqlx::query("DELETE FROM tasks WHERE id = ANY($1)")
        .bind(&ids)
        .execute(pool)
        .await
        .context("failed to delete task subtree")?;

    // The parent may have just lost its last child.
    if let Some(parent_id) = &task.parent_id {
        let remaining = get_child_tasks_by_parent_id(pool, parent_id).await?;
        if remaining.is_empty() {
            set_has_children(pool, parent_id, false).await?;
        }
    }

    tracing::info!(
        task_id,
        deleted = result.rows_affected(),
        "deleted task subtree"
    );

    Ok(result.rows_affected())
}
