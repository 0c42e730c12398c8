//! Structural validation errors raised during task-array ingestion.
//!
//! These are reported verbatim to the caller; when any of them fires,
//! nothing has been persisted.

use thiserror::Error;

/// Errors from validating an ingested task array.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("tasks array cannot be empty")]
    EmptyTaskArray,

    #[error("task at index {index} must have a 'name' field")]
    MissingName { index: usize },

    #[error(
        "mixed mode not supported: either all tasks have 'id' or none do \
         ({with_id} with id, {without_id} without)"
    )]
    MixedIdMode { with_id: usize, without_id: usize },

    #[error("duplicate task id {0:?}")]
    DuplicateId(String),

    #[error("task name {0:?} is not unique; name-based references require unique names")]
    DuplicateName(String),

    #[error("task {task:?} has parent_id {parent:?} which is not in the tasks array")]
    UnknownParent { task: String, parent: String },

    #[error("task {task:?} has dependency reference {dependency:?} which is not in the tasks array")]
    UnknownDependency { task: String, dependency: String },

    #[error("task {task:?} dependency must have an 'id' or 'name' field")]
    MissingDependencyRef { task: String },

    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    #[error(
        "missing dependent tasks: {}; every task depending on a task in the array must be included",
        .0.join(", ")
    )]
    MissingDependentTasks(Vec<String>),

    #[error("no root task found (one task must have no parent_id)")]
    NoRootTask,

    #[error("multiple root tasks found: {}; all tasks must form a single tree", .0.join(", "))]
    MultipleRoots(Vec<String>),

    #[error("tasks not reachable from the root: {}", .0.join(", "))]
    UnreachableTasks(Vec<String>),

    #[error("all tasks in one call must share a user_id; found: {}", .0.join(", "))]
    MixedUserIds(Vec<String>),
}
