//! Task-array ingestion: validate a declarative task array and persist it
//! as a single rooted tree with normalized dependency records.

pub mod validate;

use std::collections::HashMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskforge_db::models::{JsonMap, StoredDependency, Task, TaskDependency};
use taskforge_db::repository::{self, NewTask};
use taskforge_db::tree::TaskTree;

use crate::error::ValidationError;

/// One entry of an ingested task array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<JsonMap>,
}

impl TaskSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// A dependency reference as written by the caller: a bare string key or a
/// `{id|name, required?, type?}` mapping. Normalized to persisted-id
/// [`TaskDependency`] records during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    Key(String),
    Entry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default = "default_required")]
        required: bool,
        #[serde(rename = "type", default = "default_kind")]
        kind: String,
    },
}

fn default_required() -> bool {
    true
}

fn default_kind() -> String {
    "result".to_owned()
}

impl DependencyRef {
    /// The reference key: an id takes precedence over a name.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Key(key) => Some(key),
            Self::Entry { id, name, .. } => id.as_deref().or(name.as_deref()),
        }
    }

    pub fn required(&self) -> bool {
        match self {
            Self::Key(_) => true,
            Self::Entry { required, .. } => *required,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Key(_) => "result",
            Self::Entry { kind, .. } => kind,
        }
    }
}

/// Errors from [`create_task_tree_from_specs`].
#[derive(Debug, Error)]
pub enum CreateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Ingest a task array: validate it fully, persist every entry, normalize
/// parent and dependency references to persisted ids, and return the
/// assembled tree.
///
/// Validation failures leave the database untouched.
pub async fn create_task_tree_from_specs(
    pool: &PgPool,
    specs: &[TaskSpec],
) -> Result<TaskTree, CreateError> {
    let tables = validate::validate_specs(specs)?;
    info!(count = specs.len(), id_mode = tables.id_mode, "creating task tree");

    // First pass: create all rows without parents or dependencies. A
    // caller-supplied id that already exists in the repository gets a fresh
    // id; in-array references keep resolving through the caller's key.
    let mut created: Vec<Task> = Vec::with_capacity(specs.len());
    let mut key_to_id: HashMap<String, String> = HashMap::with_capacity(specs.len());

    for (index, spec) in specs.iter().enumerate() {
        let name = spec.name.clone().expect("validated");
        let key = tables.key_of(specs, index).to_owned();

        let assigned_id = match &spec.id {
            Some(provided) => {
                if repository::get_task_by_id(pool, provided)
                    .await
                    .context("failed to check for id collision")?
                    .is_some()
                {
                    let fresh = Uuid::new_v4().to_string();
                    warn!(
                        provided_id = %provided,
                        fresh_id = %fresh,
                        "task id already exists, assigning a fresh id"
                    );
                    Some(fresh)
                } else {
                    Some(provided.clone())
                }
            }
            None => None,
        };

        let task = repository::create_task(
            pool,
            NewTask {
                id: assigned_id,
                name,
                user_id: spec.user_id.clone(),
                parent_id: None,
                original_task_id: None,
                priority: Some(spec.priority.unwrap_or(1)),
                dependencies: None,
                inputs: spec.inputs.clone(),
                params: spec.params.clone(),
                schemas: spec.schemas.clone(),
            },
        )
        .await?;

        debug!(task_id = %task.id, name = %task.name, "created task row");
        key_to_id.insert(key, task.id.clone());
        created.push(task);
    }

    // Second pass: rewrite parent and dependency references to persisted
    // ids and keep the derived has_children flags consistent.
    for (index, spec) in specs.iter().enumerate() {
        if let Some(parent_key) = &spec.parent_id {
            let parent_id = key_to_id
                .get(parent_key)
                .cloned()
                .expect("validated parent reference");
            repository::set_parent(pool, &created[index].id, Some(&parent_id)).await?;
            repository::set_has_children(pool, &parent_id, true).await?;
            created[index].parent_id = Some(parent_id.clone());
            if let Some(parent) = created.iter_mut().find(|t| t.id == parent_id) {
                parent.has_children = true;
            }
        }

        if !spec.dependencies.is_empty() {
            let deps: Vec<StoredDependency> = spec
                .dependencies
                .iter()
                .map(|dep| {
                    let key = dep.key().expect("validated dependency reference");
                    StoredDependency::Record(TaskDependency {
                        id: key_to_id.get(key).cloned().expect("validated"),
                        required: dep.required(),
                        kind: dep.kind().to_owned(),
                    })
                })
                .collect();
            repository::set_dependencies(pool, &created[index].id, &deps).await?;
            created[index].dependencies = Some(sqlx::types::Json(deps));
        }
    }

    let tree = TaskTree::from_tasks(created)
        .context("persisted tasks no longer form a single rooted tree")?;

    info!(
        root_id = %tree.root().id,
        root_name = %tree.root().name,
        children = tree.children(tree.root_index()).len(),
        "created task tree"
    );

    Ok(tree)
}
