use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Mapping type used for task `inputs`, `params`, and `schemas` payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Deleted,
}

impl TaskStatus {
    /// True for statuses a task never leaves on its own (`completed`,
    /// `failed`, `cancelled`). `deleted` is handled by physical removal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// True when the task still counts as unfinished for scheduling.
    pub fn is_unfinished(self) -> bool {
        !matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "deleted" => Ok(Self::Deleted),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// A normalized dependency record stored on a task.
///
/// After ingestion every dependency references the persisted task `id`;
/// name references and bare strings are rewritten by the creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub id: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(rename = "type", default = "default_dependency_kind")]
    pub kind: String,
}

fn default_required() -> bool {
    true
}

fn default_dependency_kind() -> String {
    "result".to_owned()
}

impl TaskDependency {
    /// A required `result`-typed dependency on the given task id.
    pub fn required(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: true,
            kind: default_dependency_kind(),
        }
    }

    /// An optional dependency on the given task id.
    pub fn optional(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: false,
            kind: default_dependency_kind(),
        }
    }
}

/// A dependency as it sits in the `dependencies` column.
///
/// The creator always writes [`TaskDependency`] records, but trees written
/// by earlier tooling may carry bare id strings; the scheduler gives the
/// two forms slightly different result-merge semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredDependency {
    Key(String),
    Record(TaskDependency),
}

impl StoredDependency {
    /// The referenced task id.
    pub fn id(&self) -> &str {
        match self {
            Self::Key(id) => id,
            Self::Record(dep) => &dep.id,
        }
    }

    /// Bare-string dependencies are always required.
    pub fn required(&self) -> bool {
        match self {
            Self::Key(_) => true,
            Self::Record(dep) => dep.required,
        }
    }

    /// True for the bare-string form.
    pub fn is_bare(&self) -> bool {
        matches!(self, Self::Key(_))
    }
}

impl From<TaskDependency> for StoredDependency {
    fn from(dep: TaskDependency) -> Self {
        Self::Record(dep)
    }
}

// ---------------------------------------------------------------------------
// Row struct
// ---------------------------------------------------------------------------

/// A task row -- the unit of orchestration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub original_task_id: Option<String>,
    pub user_id: Option<String>,
    pub name: String,
    pub status: TaskStatus,
    pub priority: Option<i32>,
    pub has_children: bool,
    pub has_copy: bool,
    pub progress: f64,
    pub dependencies: Option<Json<Vec<StoredDependency>>>,
    pub inputs: Option<Json<JsonMap>>,
    pub params: Option<Json<JsonMap>>,
    pub schemas: Option<Json<JsonMap>>,
    pub result: Option<Json<serde_json::Value>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Dependencies as a slice; empty when the column is NULL.
    pub fn dependency_list(&self) -> &[StoredDependency] {
        self.dependencies.as_ref().map_or(&[], |d| d.0.as_slice())
    }

    /// Inputs as an owned map; empty when the column is NULL.
    pub fn inputs_map(&self) -> JsonMap {
        self.inputs.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }

    /// Params as an owned map; empty when the column is NULL.
    pub fn params_map(&self) -> JsonMap {
        self.params.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }

    /// Schemas as an owned map; empty when the column is NULL.
    pub fn schemas_map(&self) -> JsonMap {
        self.schemas.as_ref().map(|j| j.0.clone()).unwrap_or_default()
    }

    /// The executor result, if the task has produced one.
    pub fn result_value(&self) -> Option<&serde_json::Value> {
        self.result.as_ref().map(|j| &j.0)
    }

    /// Scheduling priority; a NULL priority sorts last.
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(999)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Deleted,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn dependency_defaults_on_deserialize() {
        let dep: TaskDependency = serde_json::from_str(r#"{"id": "a"}"#).unwrap();
        assert_eq!(dep.id, "a");
        assert!(dep.required);
        assert_eq!(dep.kind, "result");
    }

    #[test]
    fn dependency_serializes_type_field() {
        let dep = TaskDependency::required("a");
        let value = serde_json::to_value(&dep).unwrap();
        assert_eq!(value["type"], "result");
        assert_eq!(value["required"], true);
    }

    #[test]
    fn dependency_optional_deserialize() {
        let dep: TaskDependency =
            serde_json::from_str(r#"{"id": "b", "required": false, "type": "artifact"}"#).unwrap();
        assert!(!dep.required);
        assert_eq!(dep.kind, "artifact");
    }

    #[test]
    fn stored_dependency_accepts_both_forms() {
        let deps: Vec<StoredDependency> =
            serde_json::from_str(r#"["bare-id", {"id": "rec", "required": false}]"#).unwrap();
        assert!(deps[0].is_bare());
        assert_eq!(deps[0].id(), "bare-id");
        assert!(deps[0].required());
        assert!(!deps[1].is_bare());
        assert_eq!(deps[1].id(), "rec");
        assert!(!deps[1].required());
    }
}
