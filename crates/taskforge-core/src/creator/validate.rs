//! Pure structural validation for ingested task arrays.
//!
//! Everything here runs before a single row is written, so a failing array
//! leaves the database untouched.

use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;

use super::{DependencyRef, TaskSpec};

/// Identifier tables for one ingested array.
///
/// In id-mode every entry supplied an `id`; in name-mode none did and the
/// (unique) `name` acts as the reference key.
#[derive(Debug)]
pub struct IdentifierTables {
    pub id_mode: bool,
    /// Reference key (id or name) to index in the array.
    pub key_to_index: HashMap<String, usize>,
}

impl IdentifierTables {
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_index.contains_key(key)
    }

    /// The reference key of the entry at `index`.
    pub fn key_of<'a>(&self, specs: &'a [TaskSpec], index: usize) -> &'a str {
        let spec = &specs[index];
        if self.id_mode {
            spec.id.as_deref().unwrap_or_default()
        } else {
            spec.name.as_deref().unwrap_or_default()
        }
    }
}

/// Detect the identifier mode and build the reference tables.
///
/// Fails on a missing name, mixed id/no-id mode, or duplicate keys.
pub fn build_identifier_tables(specs: &[TaskSpec]) -> Result<IdentifierTables, ValidationError> {
    if specs.is_empty() {
        return Err(ValidationError::EmptyTaskArray);
    }

    for (index, spec) in specs.iter().enumerate() {
        if spec.name.as_deref().is_none_or(str::is_empty) {
            return Err(ValidationError::MissingName { index });
        }
    }

    let with_id = specs.iter().filter(|s| s.id.is_some()).count();
    let without_id = specs.len() - with_id;
    if with_id > 0 && without_id > 0 {
        return Err(ValidationError::MixedIdMode { with_id, without_id });
    }
    let id_mode = with_id > 0;

    let mut key_to_index = HashMap::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let key = if id_mode {
            spec.id.clone().expect("id-mode entry has an id")
        } else {
            spec.name.clone().expect("name checked above")
        };
        if key_to_index.insert(key.clone(), index).is_some() {
            return Err(if id_mode {
                ValidationError::DuplicateId(key)
            } else {
                ValidationError::DuplicateName(key)
            });
        }
    }

    Ok(IdentifierTables {
        id_mode,
        key_to_index,
    })
}

/// Validate that every `parent_id` and dependency reference resolves to an
/// entry of the array.
pub fn validate_references(
    specs: &[TaskSpec],
    tables: &IdentifierTables,
) -> Result<(), ValidationError> {
    for spec in specs {
        let task_name = spec.name.clone().unwrap_or_default();

        if let Some(parent) = &spec.parent_id {
            if !tables.contains(parent) {
                return Err(ValidationError::UnknownParent {
                    task: task_name,
                    parent: parent.clone(),
                });
            }
        }

        for dep in &spec.dependencies {
            match dep.key() {
                None => {
                    return Err(ValidationError::MissingDependencyRef { task: task_name });
                }
                Some(key) => {
                    if !tables.contains(key) {
                        return Err(ValidationError::UnknownDependency {
                            task: task_name,
                            dependency: key.to_owned(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Depth-first cycle detection over the declared dependency graph.
///
/// A back-edge into the current DFS path is a cycle; the error reports the
/// cycle as task names in declaration order, " -> "-joined.
pub fn detect_cycles(
    specs: &[TaskSpec],
    tables: &IdentifierTables,
) -> Result<(), ValidationError> {
    // Adjacency by array index: task -> its dependencies.
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (index, spec) in specs.iter().enumerate() {
        for dep in &spec.dependencies {
            if let Some(key) = dep.key() {
                if let Some(&dep_index) = tables.key_to_index.get(key) {
                    adjacency[index].push(dep_index);
                }
            }
        }
    }

    let mut visited = vec![false; specs.len()];
    let mut on_path = vec![false; specs.len()];
    let mut path: Vec<usize> = Vec::new();

    fn dfs(
        node: usize,
        adjacency: &[Vec<usize>],
        visited: &mut [bool],
        on_path: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        if on_path[node] {
            let start = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if visited[node] {
            return None;
        }
        visited[node] = true;
        on_path[node] = true;
        path.push(node);

        for &dep in &adjacency[node] {
            if let Some(cycle) = dfs(dep, adjacency, visited, on_path, path) {
                return Some(cycle);
            }
        }

        path.pop();
        on_path[node] = false;
        None
    }

    for start in 0..specs.len() {
        if visited[start] {
            continue;
        }
        if let Some(cycle) = dfs(start, &adjacency, &mut visited, &mut on_path, &mut path) {
            let names: Vec<&str> = cycle
                .iter()
                .map(|&i| specs[i].name.as_deref().unwrap_or("?"))
                .collect();
            return Err(ValidationError::CircularDependency(names.join(" -> ")));
        }
    }

    Ok(())
}

/// Transitive dependents (by array index) of a set of reference keys.
pub fn find_transitive_dependents(
    seed_keys: &HashSet<String>,
    specs: &[TaskSpec],
    tables: &IdentifierTables,
) -> HashSet<usize> {
    let mut dependents: HashSet<usize> = HashSet::new();
    let mut frontier: HashSet<String> = seed_keys.clone();
    let mut processed: HashSet<String> = HashSet::new();

    while !frontier.is_empty() {
        let mut next: HashSet<String> = HashSet::new();
        for key in frontier.drain() {
            if !processed.insert(key.clone()) {
                continue;
            }
            for (index, spec) in specs.iter().enumerate() {
                if dependents.contains(&index) {
                    continue;
                }
                let depends = spec
                    .dependencies
                    .iter()
                    .any(|d| d.key() == Some(key.as_str()));
                if depends {
                    dependents.insert(index);
                    next.insert(tables.key_of(specs, index).to_owned());
                }
            }
        }
        frontier = next;
    }

    dependents
}

/// Every task that (transitively) depends on a member of the array must be
/// a member of the array.
pub fn validate_dependent_closure(
    specs: &[TaskSpec],
    tables: &IdentifierTables,
) -> Result<(), ValidationError> {
    let all_keys: HashSet<String> = tables.key_to_index.keys().cloned().collect();
    let dependents = find_transitive_dependents(&all_keys, specs, tables);

    let missing: Vec<String> = dependents
        .iter()
        .filter(|&&index| !all_keys.contains(tables.key_of(specs, index)))
        .map(|&index| specs[index].name.clone().unwrap_or_default())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::MissingDependentTasks(missing))
    }
}

/// Single-root and reachability checks over the declared parent chains.
pub fn validate_structure(
    specs: &[TaskSpec],
    tables: &IdentifierTables,
) -> Result<(), ValidationError> {
    let roots: Vec<usize> = specs
        .iter()
        .enumerate()
        .filter(|(_, s)| s.parent_id.is_none())
        .map(|(i, _)| i)
        .collect();

    match roots.as_slice() {
        [] => return Err(ValidationError::NoRootTask),
        [_] => {}
        many => {
            return Err(ValidationError::MultipleRoots(
                many.iter()
                    .map(|&i| specs[i].name.clone().unwrap_or_default())
                    .collect(),
            ));
        }
    }

    // Children-of map over reference keys, then BFS from the root.
    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, spec) in specs.iter().enumerate() {
        if let Some(parent) = spec.parent_id.as_deref() {
            children.entry(parent).or_default().push(index);
        }
    }

    let mut reachable: HashSet<usize> = HashSet::new();
    let mut frontier = vec![roots[0]];
    while let Some(index) = frontier.pop() {
        if !reachable.insert(index) {
            continue;
        }
        let key = tables.key_of(specs, index);
        if let Some(kids) = children.get(key) {
            frontier.extend(kids.iter().copied());
        }
    }

    let unreachable: Vec<String> = (0..specs.len())
        .filter(|i| !reachable.contains(i))
        .map(|i| specs[i].name.clone().unwrap_or_default())
        .collect();

    if unreachable.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::UnreachableTasks(unreachable))
    }
}

/// Run the full pre-persistence validation pipeline.
pub fn validate_specs(specs: &[TaskSpec]) -> Result<IdentifierTables, ValidationError> {
    let tables = build_identifier_tables(specs)?;
    validate_references(specs, &tables)?;
    detect_cycles(specs, &tables)?;
    validate_dependent_closure(specs, &tables)?;
    validate_structure(specs, &tables)?;
    Ok(tables)
}
