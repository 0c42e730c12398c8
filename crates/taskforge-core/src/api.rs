//! Task-management RPC handlers.
//!
//! One async handler per method, over typed serde parameter structs.
//! Protocol adapters (HTTP, JSON-RPC, whatever embeds the engine) parse
//! their wire format into these params and serialize the returned values;
//! authentication and permission checks happen in the adapter before the
//! call ever reaches this layer.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskforge_db::models::{JsonMap, TaskStatus};
use taskforge_db::repository::{OrderBy, QueryFilter, ROOT_TASKS_ONLY, TaskPatch};

use crate::copy::CopyOptions;
use crate::creator::TaskSpec;
use crate::error::ValidationError;
use crate::facade::{ExecuteOptions, ExecuteResponse, RunningStatus, TaskService};
use crate::manager::CancelReport;
use crate::streaming::{ProgressEvent, WebhookConfig};

fn default_true() -> bool {
    true
}

fn default_limit() -> i64 {
    100
}

/// `tasks.create` params: one task mapping or an array of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CreateParams {
    Many(Vec<TaskSpec>),
    One(Box<TaskSpec>),
}

impl CreateParams {
    fn into_specs(self) -> Vec<TaskSpec> {
        match self {
            Self::Many(specs) => specs,
            Self::One(spec) => vec![*spec],
        }
    }
}

/// Params carrying a single task id.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskIdParams {
    #[serde(alias = "id")]
    pub task_id: String,
}

/// `tasks.tree` params.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeParams {
    #[serde(alias = "root_id")]
    pub task_id: String,
}

/// `tasks.list` params.
#[derive(Debug, Clone, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default = "default_true")]
    pub root_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// `tasks.children` params.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildrenParams {
    #[serde(alias = "task_id")]
    pub parent_id: String,
}

/// `tasks.update` params; only the writable fields.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateParams {
    pub task_id: String,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub inputs: Option<JsonMap>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// `tasks.copy` params.
#[derive(Debug, Clone, Deserialize)]
pub struct CopyParams {
    pub task_id: String,
    #[serde(default)]
    pub children: bool,
    #[serde(default = "default_true")]
    pub save: bool,
}

/// `tasks.cancel` params.
#[derive(Debug, Clone, Deserialize)]
pub struct CancelParams {
    #[serde(alias = "context_ids")]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// `tasks.execute` params.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteParams {
    #[serde(alias = "id")]
    pub task_id: String,
    #[serde(default)]
    pub use_streaming: bool,
    #[serde(default)]
    pub webhook_config: Option<WebhookConfig>,
}

/// `tasks.delete` response.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub task_id: String,
    pub deleted_count: u64,
}

/// `tasks.running.count` response.
#[derive(Debug, Clone, Serialize)]
pub struct RunningCountResponse {
    pub count: usize,
}

/// The handler surface protocol adapters call into.
pub struct Api {
    service: Arc<TaskService>,
}

impl Api {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    /// `tasks.create` -- normalize to an array, require one shared
    /// user_id, ingest, and return the nested tree.
    pub async fn handle_create(&self, params: CreateParams) -> Result<Value> {
        let specs = params.into_specs();

        let user_ids: BTreeSet<&str> = specs
            .iter()
            .filter_map(|s| s.user_id.as_deref())
            .collect();
        if user_ids.len() > 1 {
            return Err(ValidationError::MixedUserIds(
                user_ids.into_iter().map(str::to_owned).collect(),
            )
            .into());
        }

        let tree = self.service.create_task_tree(&specs).await?;
        Ok(tree.to_json())
    }

    /// `tasks.get` -- task mapping or null.
    pub async fn handle_get(&self, params: TaskIdParams) -> Result<Option<Value>> {
        let task = self.service.get_task(&params.task_id).await?;
        Ok(task
            .map(|t| serde_json::to_value(t).context("failed to serialize task"))
            .transpose()?)
    }

    /// `tasks.detail` -- alias of `tasks.get`.
    pub async fn handle_detail(&self, params: TaskIdParams) -> Result<Option<Value>> {
        self.handle_get(params).await
    }

    /// `tasks.tree` -- nested mapping; walks up to the root first.
    pub async fn handle_tree(&self, params: TreeParams) -> Result<Value> {
        let tree = self.service.get_task_tree(&params.task_id).await?;
        Ok(tree.to_json())
    }

    /// `tasks.list`.
    pub async fn handle_list(&self, params: ListParams) -> Result<Vec<Value>> {
        let filter = QueryFilter {
            user_id: params.user_id,
            status: params.status,
            parent_id: params.root_only.then(|| ROOT_TASKS_ONLY.to_owned()),
            limit: params.limit,
            offset: params.offset,
            order_by: OrderBy::CreatedAt,
            order_desc: true,
        };
        let tasks = self.service.list_tasks(&filter).await?;
        tasks
            .into_iter()
            .map(|t| serde_json::to_value(t).context("failed to serialize task"))
            .collect()
    }

    /// `tasks.children`.
    pub async fn handle_children(&self, params: ChildrenParams) -> Result<Vec<Value>> {
        let tasks = self.service.child_tasks(&params.parent_id).await?;
        tasks
            .into_iter()
            .map(|t| serde_json::to_value(t).context("failed to serialize task"))
            .collect()
    }

    /// `tasks.running.list`.
    pub fn handle_running_list(&self) -> Vec<String> {
        self.service.running_ids()
    }

    /// `tasks.running.status`.
    pub async fn handle_running_status(&self) -> Result<Vec<RunningStatus>> {
        self.service.running_status().await
    }

    /// `tasks.running.count`.
    pub fn handle_running_count(&self) -> RunningCountResponse {
        RunningCountResponse {
            count: self.service.running_count(),
        }
    }

    /// `tasks.update`.
    pub async fn handle_update(&self, params: UpdateParams) -> Result<Value> {
        let patch = TaskPatch {
            status: params.status,
            error: params.error.map(Some),
            result: params.result,
            progress: params.progress,
            inputs: params.inputs,
            started_at: params.started_at,
            completed_at: params.completed_at,
        };
        let task = self.service.update_task(&params.task_id, patch).await?;
        serde_json::to_value(task).context("failed to serialize task")
    }

    /// `tasks.delete` -- pending-subtree-only policy; reports the
    /// removed row count.
    pub async fn handle_delete(&self, params: TaskIdParams) -> Result<DeleteResponse> {
        let deleted_count = self.service.delete_task(&params.task_id).await?;
        Ok(DeleteResponse {
            success: true,
            task_id: params.task_id,
            deleted_count,
        })
    }

    /// `tasks.copy` -- returns the nested clone tree.
    pub async fn handle_copy(&self, params: CopyParams) -> Result<Value> {
        if !params.save {
            bail!("tasks.copy with save=false is not supported: a copy is only useful persisted");
        }
        let tree = self
            .service
            .copy_task(
                &params.task_id,
                CopyOptions {
                    children: params.children,
                },
            )
            .await?;
        Ok(tree.to_json())
    }

    /// `tasks.cancel` (alias `tasks.running.cancel`).
    pub async fn handle_cancel(&self, params: CancelParams) -> Result<Vec<CancelReport>> {
        if params.task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let message = params.error_message.unwrap_or_else(|| {
            if params.force {
                "Force cancelled by user".to_owned()
            } else {
                "Cancelled by user".to_owned()
            }
        });
        self.service
            .cancel_tasks(&params.task_ids, Some(&message))
            .await
    }

    /// `tasks.execute`.
    pub async fn handle_execute(&self, params: ExecuteParams) -> Result<ExecuteResponse> {
        self.service
            .execute_task_by_id(
                &params.task_id,
                ExecuteOptions {
                    use_streaming: params.use_streaming,
                    webhook: params.webhook_config,
                },
            )
            .await
    }

    /// Buffered events for the adapter's `/events?task_id=<root>` SSE
    /// endpoint.
    pub fn handle_events(&self, params: TaskIdParams) -> Vec<ProgressEvent> {
        self.service.streaming_events(&params.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_params_accept_single_and_array() {
        let one: CreateParams = serde_json::from_value(json!({"name": "solo"})).unwrap();
        assert_eq!(one.clone().into_specs().len(), 1);

        let many: CreateParams =
            serde_json::from_value(json!([{"name": "a"}, {"name": "b", "parent_id": "a"}]))
                .unwrap();
        assert_eq!(many.into_specs().len(), 2);
    }

    #[test]
    fn task_id_alias() {
        let params: TaskIdParams = serde_json::from_value(json!({"id": "t-1"})).unwrap();
        assert_eq!(params.task_id, "t-1");
    }

    #[test]
    fn list_params_defaults() {
        let params: ListParams = serde_json::from_value(json!({})).unwrap();
        assert!(params.root_only);
        assert_eq!(params.limit, 100);
        assert_eq!(params.offset, 0);
        assert!(params.status.is_none());
    }

    #[test]
    fn execute_params_defaults() {
        let params: ExecuteParams = serde_json::from_value(json!({"task_id": "x"})).unwrap();
        assert!(!params.use_streaming);
        assert!(params.webhook_config.is_none());
    }

    #[test]
    fn cancel_params_accept_context_ids_alias() {
        let params: CancelParams =
            serde_json::from_value(json!({"context_ids": ["a", "b"], "force": true})).unwrap();
        assert_eq!(params.task_ids, vec!["a", "b"]);
        assert!(params.force);
    }

    #[test]
    fn copy_params_default_save() {
        let params: CopyParams = serde_json::from_value(json!({"task_id": "x"})).unwrap();
        assert!(params.save);
        assert!(!params.children);
    }
}
