//! Re-executable clones of a subgraph and its dependents.
//!
//! Cloning a task copies its subtree, pulls in every task that
//! (transitively) depends on a member of that subtree, prunes pending
//! dependents when the subtree holds a failed leaf (those stay behind as
//! the originals, waiting their turn), and persists a fresh `pending`
//! tree linked to the originals through `original_task_id`.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info};

use taskforge_db::models::{StoredDependency, Task, TaskDependency, TaskStatus};
use taskforge_db::repository::{self, NewTask};
use taskforge_db::tree::TaskTree;

/// Options for [`create_task_copy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Also consider each direct child's subtree when collecting the
    /// identifiers whose dependents are pulled in. The collected set is
    /// identical to the default subtree walk; the flag is accepted for
    /// callers that spell the intent out.
    pub children: bool,
}

/// Clone the minimal enclosing subtree around `original` and its
/// dependent closure. Returns the persisted clone tree.
pub async fn create_task_copy(
    pool: &PgPool,
    original: &Task,
    options: CopyOptions,
) -> Result<TaskTree> {
    info!(task_id = %original.id, children = options.children, "creating task copy");

    let root = repository::get_root_task(pool, original).await?;
    let root_tree = repository::build_task_tree(pool, &root).await?;
    let anchor = root_tree
        .index_of(&original.id)
        .context("task missing from its own tree")?;

    let subtree: HashSet<usize> = root_tree.subtree_indices(anchor).into_iter().collect();

    // Identifiers (ids and names) of the subtree; dependents may
    // reference either.
    let mut identifiers: HashSet<String> = HashSet::new();
    for &idx in &subtree {
        let task = root_tree.task(idx);
        identifiers.insert(task.id.clone());
        identifiers.insert(task.name.clone());
    }

    let dependents = transitive_dependents(&root_tree, &identifiers);

    // A failed leaf in the subtree means this copy is a retry: pending
    // dependents keep waiting on the originals and are not cloned.
    let has_failed_leaf = subtree.iter().any(|&idx| {
        root_tree.children(idx).is_empty() && root_tree.task(idx).status == TaskStatus::Failed
    });

    let mut required: HashSet<usize> = subtree.union(&dependents).copied().collect();
    if has_failed_leaf {
        let before = required.len();
        required.retain(|&idx| {
            !(dependents.contains(&idx) && root_tree.task(idx).status == TaskStatus::Pending)
        });
        debug!(
            dropped = before - required.len(),
            "dropped pending dependents for failed-leaf copy"
        );
    }

    // Minimal enclosing subtree: the subtree itself when no outside
    // dependents survive, otherwise the root tree pruned to branches
    // containing required nodes.
    let minimal_root = if required.iter().all(|idx| subtree.contains(idx)) {
        anchor
    } else {
        root_tree.root_index()
    };
    let keep = enclosing_nodes(&root_tree, minimal_root, &required);

    let root_original_id = root_tree.task(minimal_root).id.clone();

    // Clone pass: create all rows first, then link parents and rewrite
    // dependency edges onto the clone ids.
    let order: Vec<usize> = root_tree
        .subtree_indices(minimal_root)
        .into_iter()
        .filter(|idx| keep.contains(idx))
        .collect();

    let mut id_map: HashMap<String, String> = HashMap::with_capacity(order.len());
    let mut clones: Vec<(usize, Task)> = Vec::with_capacity(order.len());

    for &idx in &order {
        let source = root_tree.task(idx);
        let clone = repository::create_task(
            pool,
            NewTask {
                id: None,
                name: source.name.clone(),
                user_id: source.user_id.clone(),
                parent_id: None,
                original_task_id: Some(root_original_id.clone()),
                priority: source.priority,
                dependencies: None,
                inputs: source.inputs.as_ref().map(|j| j.0.clone()),
                params: source.params.as_ref().map(|j| j.0.clone()),
                schemas: source.schemas.as_ref().map(|j| j.0.clone()),
            },
        )
        .await?;
        id_map.insert(source.id.clone(), clone.id.clone());
        clones.push((idx, clone));
    }

    for (idx, clone) in &mut clones {
        let source = root_tree.task(*idx);

        if *idx != minimal_root {
            let parent_idx = root_tree
                .parent(*idx)
                .context("kept non-root clone must have a parent")?;
            let parent_clone_id = id_map
                .get(&root_tree.task(parent_idx).id)
                .context("parent of kept node must itself be kept")?
                .clone();
            repository::set_parent(pool, &clone.id, Some(&parent_clone_id)).await?;
            repository::set_has_children(pool, &parent_clone_id, true).await?;
            clone.parent_id = Some(parent_clone_id);
        }

        let source_deps = source.dependency_list();
        if !source_deps.is_empty() {
            let remapped: Vec<StoredDependency> = source_deps
                .iter()
                .map(|dep| remap_dependency(dep, &id_map))
                .collect();
            repository::set_dependencies(pool, &clone.id, &remapped).await?;
            clone.dependencies = Some(sqlx::types::Json(remapped));
        }
    }

    for &idx in &order {
        repository::set_has_copy(pool, &root_tree.task(idx).id, true).await?;
    }

    // Keep the in-memory clones' derived flags consistent with storage.
    let child_parents: HashSet<String> = clones
        .iter()
        .filter_map(|(_, c)| c.parent_id.clone())
        .collect();
    for (_, clone) in clones.iter_mut() {
        clone.has_children = child_parents.contains(&clone.id);
    }

    let clone_tasks: Vec<Task> = clones.into_iter().map(|(_, c)| c).collect();
    let tree = TaskTree::from_tasks(clone_tasks).context("cloned tasks must form a tree")?;

    info!(
        clone_root = %tree.root().id,
        original_root = %root_original_id,
        cloned = tree.len(),
        "created task copy"
    );

    Ok(tree)
}

/// Indices of tasks in `tree` that transitively depend on any identifier
/// in `seeds` (matched against dependency ids, which may be ids or, for
/// trees written by other tooling, names).
fn transitive_dependents(tree: &TaskTree, seeds: &HashSet<String>) -> HashSet<usize> {
    let mut dependents: HashSet<usize> = HashSet::new();
    let mut keys: HashSet<String> = seeds.clone();

    loop {
        let mut grew = false;
        for (idx, task) in tree.tasks().iter().enumerate() {
            if dependents.contains(&idx) {
                continue;
            }
            let depends = task
                .dependency_list()
                .iter()
                .any(|dep| keys.contains(dep.id()));
            if depends {
                dependents.insert(idx);
                keys.insert(task.id.clone());
                keys.insert(task.name.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    dependents
}

/// Nodes of the minimal enclosing subtree: every node under `from` whose
/// subtree contains at least one required node.
fn enclosing_nodes(tree: &TaskTree, from: usize, required: &HashSet<usize>) -> HashSet<usize> {
    let mut keep = HashSet::new();
    for idx in tree.subtree_indices(from) {
        if tree
            .subtree_indices(idx)
            .iter()
            .any(|member| required.contains(member))
        {
            keep.insert(idx);
        }
    }
    keep
}

/// Rewrite a dependency onto the clone of its target when that target was
/// cloned; references outside the copied set are preserved.
fn remap_dependency(dep: &StoredDependency, id_map: &HashMap<String, String>) -> StoredDependency {
    match id_map.get(dep.id()) {
        None => dep.clone(),
        Some(clone_id) => match dep {
            StoredDependency::Key(_) => StoredDependency::Key(clone_id.clone()),
            StoredDependency::Record(record) => StoredDependency::Record(TaskDependency {
                id: clone_id.clone(),
                required: record.required,
                kind: record.kind.clone(),
            }),
        },
    }
}
