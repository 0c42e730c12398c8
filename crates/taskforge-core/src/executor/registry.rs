//! Executor registry -- id-keyed lookup of pluggable executor factories
//! with a secondary index by kind.
//!
//! Registration is a startup activity: a [`RegistryBuilder`] is populated
//! once and frozen into an immutable `Arc<ExecutorRegistry>` snapshot that
//! the facade and every manager capture at construction. Tests rebuild
//! their own snapshots freely.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::Value;

use taskforge_db::models::JsonMap;

use super::ExecutorFactory;

/// Default `schemas.type` when a task declares none.
pub const DEFAULT_KIND: &str = "stdio";

/// Builder for an [`ExecutorRegistry`] snapshot.
#[derive(Default)]
pub struct RegistryBuilder {
    by_id: HashMap<String, Arc<dyn ExecutorFactory>>,
    /// kind -> id of the first factory registered for that kind.
    by_kind: HashMap<String, String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor factory under its declared id.
    ///
    /// Re-registering an id replaces the previous factory. The kind index
    /// keeps the first registration for each kind unless replaced by id.
    pub fn register_extension(mut self, factory: impl ExecutorFactory + 'static) -> Self {
        let id = factory.id().to_owned();
        let kind = factory.kind().to_owned();
        self.by_kind.entry(kind).or_insert_with(|| id.clone());
        self.by_id.insert(id, Arc::new(factory));
        self
    }

    /// Register the executors shipped with the engine.
    pub fn with_builtins(self) -> Self {
        self.register_extension(crate::extensions::EchoExecutorFactory)
            .register_extension(crate::extensions::AggregateResultsFactory)
    }

    /// Freeze into an immutable snapshot.
    pub fn build(self) -> Arc<ExecutorRegistry> {
        Arc::new(ExecutorRegistry {
            by_id: self.by_id,
            by_kind: self.by_kind,
        })
    }
}

/// Immutable registry snapshot.
pub struct ExecutorRegistry {
    by_id: HashMap<String, Arc<dyn ExecutorFactory>>,
    by_kind: HashMap<String, String>,
}

impl ExecutorRegistry {
    /// Look up a factory by id.
    pub fn get_by_id(&self, id: &str) -> Option<&Arc<dyn ExecutorFactory>> {
        self.by_id.get(id)
    }

    /// Look up a factory by kind.
    pub fn get_by_kind(&self, kind: &str) -> Option<&Arc<dyn ExecutorFactory>> {
        self.by_kind.get(kind).and_then(|id| self.by_id.get(id))
    }

    /// Registered ids, sorted for stable diagnostics.
    pub fn registered_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.by_id.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Registered kinds, sorted for stable diagnostics.
    pub fn registered_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.by_kind.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Resolve the factory for a task.
    ///
    /// Lookup order: `params.executor_id`, then `schemas.method` as an id,
    /// then the registered kind equal to `schemas.type` (defaulting to
    /// `"stdio"`). No match fails with a diagnostic listing everything
    /// registered; the caller marks the task failed with it.
    pub fn resolve(
        &self,
        params: &JsonMap,
        schemas: &JsonMap,
    ) -> Result<&Arc<dyn ExecutorFactory>> {
        if let Some(executor_id) = params.get("executor_id").and_then(Value::as_str) {
            if let Some(factory) = self.get_by_id(executor_id) {
                return Ok(factory);
            }
        }

        let method = schemas.get("method").and_then(Value::as_str);
        if let Some(method) = method {
            if let Some(factory) = self.get_by_id(method) {
                return Ok(factory);
            }
        }

        let kind = schemas
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_KIND);
        if let Some(factory) = self.get_by_kind(kind) {
            return Ok(factory);
        }

        bail!(
            "no executor registered for type={kind:?}, method={method:?}; \
             registered ids: [{}], registered types: [{}]",
            self.registered_ids().join(", "),
            self.registered_kinds().join(", "),
        )
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("ids", &self.registered_ids())
            .finish()
    }
}
