//! Arena-backed task tree.
//!
//! A tree is a flat vector of task rows plus parent/children index arrays
//! and an id index. Cross-tree dependency edges stay on the task rows
//! themselves; the arena only models the `parent_id` hierarchy.

use std::collections::HashMap;

use serde_json::{Value, json};
use thiserror::Error;

use crate::models::{Task, TaskStatus};

/// Errors raised while assembling a [`TaskTree`] from task rows.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("no root task found (task without parent_id)")]
    NoRoot,

    #[error("multiple root tasks found: {}", .0.join(", "))]
    MultipleRoots(Vec<String>),

    #[error("task {task:?} references parent {parent:?} which is not in the tree")]
    MissingParent { task: String, parent: String },

    #[error("tasks not reachable from the root: {}", .0.join(", "))]
    Unreachable(Vec<String>),

    #[error("tree cannot be built from an empty task list")]
    Empty,
}

/// A rooted task tree over a flat arena of task rows.
#[derive(Debug, Clone)]
pub struct TaskTree {
    nodes: Vec<Task>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    index_by_id: HashMap<String, usize>,
    root: usize,
}

impl TaskTree {
    /// Assemble a tree from task rows.
    ///
    /// Requires exactly one row with no `parent_id`; every other row must
    /// be reachable from it through parent chains. Children are kept in
    /// the order the rows were supplied.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self, TreeError> {
        Self::build(tasks, None)
    }

    /// Assemble a subtree whose root is the row with `root_id`.
    ///
    /// The root row may carry a `parent_id` pointing outside the supplied
    /// set (it is a mid-tree node); every other row must resolve inside.
    pub fn from_tasks_with_root(root_id: &str, tasks: Vec<Task>) -> Result<Self, TreeError> {
        Self::build(tasks, Some(root_id))
    }

    fn build(tasks: Vec<Task>, root_id: Option<&str>) -> Result<Self, TreeError> {
        if tasks.is_empty() {
            return Err(TreeError::Empty);
        }

        let index_by_id: HashMap<String, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let designated_root = match root_id {
            Some(id) => Some(*index_by_id.get(id).ok_or(TreeError::NoRoot)?),
            None => None,
        };

        let mut parents = vec![None; tasks.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
        let mut roots = Vec::new();

        for (i, task) in tasks.iter().enumerate() {
            if designated_root == Some(i) {
                // A designated root may point at a parent outside this set.
                continue;
            }
            match &task.parent_id {
                None => roots.push(i),
                Some(parent_id) => {
                    let parent_idx = *index_by_id.get(parent_id).ok_or_else(|| {
                        TreeError::MissingParent {
                            task: task.id.clone(),
                            parent: parent_id.clone(),
                        }
                    })?;
                    parents[i] = Some(parent_idx);
                    children[parent_idx].push(i);
                }
            }
        }

        let root = match designated_root {
            Some(idx) => {
                if !roots.is_empty() {
                    let mut names: Vec<String> =
                        roots.iter().map(|&i| tasks[i].name.clone()).collect();
                    names.insert(0, tasks[idx].name.clone());
                    return Err(TreeError::MultipleRoots(names));
                }
                idx
            }
            None => match roots.as_slice() {
                [] => return Err(TreeError::NoRoot),
                [single] => *single,
                many => {
                    return Err(TreeError::MultipleRoots(
                        many.iter().map(|&i| tasks[i].name.clone()).collect(),
                    ));
                }
            },
        };

        // Everything must hang off the root. A parent chain that loops or
        // dangles shows up here as an unreachable node.
        let mut reachable = vec![false; tasks.len()];
        let mut frontier = vec![root];
        while let Some(idx) = frontier.pop() {
            if reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            frontier.extend(children[idx].iter().copied());
        }
        let orphans: Vec<String> = reachable
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(i, _)| tasks[i].name.clone())
            .collect();
        if !orphans.is_empty() {
            return Err(TreeError::Unreachable(orphans));
        }

        Ok(Self {
            nodes: tasks,
            parents,
            children,
            index_by_id,
            root,
        })
    }

    /// Index of the root node.
    pub fn root_index(&self) -> usize {
        self.root
    }

    /// The root task row.
    pub fn root(&self) -> &Task {
        &self.nodes[self.root]
    }

    /// Number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Never true for a successfully built tree; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Task row at an arena index.
    pub fn task(&self, idx: usize) -> &Task {
        &self.nodes[idx]
    }

    /// All task rows, in arena order.
    pub fn tasks(&self) -> &[Task] {
        &self.nodes
    }

    /// Child indices of a node, in insertion order.
    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }

    /// Parent index of a node; `None` for the root.
    pub fn parent(&self, idx: usize) -> Option<usize> {
        self.parents[idx]
    }

    /// Arena index for a task id.
    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index_by_id.get(task_id).copied()
    }

    /// Task row by id.
    pub fn task_by_id(&self, task_id: &str) -> Option<&Task> {
        self.index_of(task_id).map(|i| &self.nodes[i])
    }

    /// Preorder indices of the subtree rooted at `idx` (inclusive).
    pub fn subtree_indices(&self, idx: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            out.push(i);
            // Reversed so children pop in insertion order.
            stack.extend(self.children[i].iter().rev().copied());
        }
        out
    }

    /// Fraction of nodes in the tree that are completed.
    pub fn aggregate_progress(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let completed = self
            .nodes
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        completed as f64 / self.nodes.len() as f64
    }

    /// Collapsed status of the whole tree: completed when every node is,
    /// otherwise failed / in-progress / pending by severity.
    pub fn aggregate_status(&self) -> TaskStatus {
        if self
            .nodes
            .iter()
            .all(|t| t.status == TaskStatus::Completed)
        {
            return TaskStatus::Completed;
        }
        if self.nodes.iter().any(|t| t.status == TaskStatus::Failed) {
            return TaskStatus::Failed;
        }
        if self
            .nodes
            .iter()
            .any(|t| t.status == TaskStatus::InProgress)
        {
            return TaskStatus::InProgress;
        }
        TaskStatus::Pending
    }

    /// Render the tree as a nested mapping with `children` arrays, the
    /// shape RPC responses use.
    pub fn to_json(&self) -> Value {
        self.node_json(self.root)
    }

    fn node_json(&self, idx: usize) -> Value {
        let mut value = serde_json::to_value(&self.nodes[idx]).unwrap_or_else(|_| json!({}));
        if !self.children[idx].is_empty() {
            let children: Vec<Value> = self.children[idx]
                .iter()
                .map(|&c| self.node_json(c))
                .collect();
            value["children"] = Value::Array(children);
        }
        value
    }
}
