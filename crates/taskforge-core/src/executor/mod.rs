//! The executor seam: the object-safe [`Executor`] trait, the per-task
//! construction contract, and the process-wide registry.

pub mod registry;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use taskforge_db::models::JsonMap;

pub use registry::{ExecutorRegistry, RegistryBuilder};

/// Snapshot of a task's cancellation state, taken when the executor is
/// constructed. Live cancellation of a running executor goes through
/// [`Executor::cancel`] on the stored instance instead.
#[derive(Debug, Clone, Copy)]
pub struct CancellationChecker {
    cancelled: bool,
}

impl CancellationChecker {
    pub fn snapshot(cancelled: bool) -> Self {
        Self { cancelled }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// What a cancelled executor hands back: optional token accounting and an
/// optional partial result, both folded into the final persisted row.
#[derive(Debug, Clone, Default)]
pub struct CancelOutcome {
    pub token_usage: Option<Value>,
    pub partial_result: Option<Value>,
}

/// A running task's executor instance.
///
/// One instance is constructed per task execution. Instances that report
/// `cancelable() == true` are kept in the live-instance map while
/// `execute` is in flight so an out-of-band cancel can reach them.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the task against its resolved inputs and return the result
    /// mapping persisted on the task row.
    async fn execute(&self, inputs: &JsonMap) -> Result<Value>;

    /// Whether [`Executor::cancel`] may be called while `execute` runs.
    fn cancelable(&self) -> bool {
        false
    }

    /// Interrupt a running execution. Only invoked when
    /// [`Executor::cancelable`] is true.
    async fn cancel(&self) -> Option<CancelOutcome> {
        None
    }
}

/// Everything an executor instance is constructed with.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    /// The resolved execution payload.
    pub inputs: JsonMap,
    /// The task's `params` minus `executor_id`.
    pub options: JsonMap,
    /// `schemas.input_schema`, when declared.
    pub input_schema: Option<Value>,
    /// Cancellation snapshot at construction time.
    pub cancellation: CancellationChecker,
}

/// Factory side of the registry: declares the executor's identity
/// statically and builds one instance per task execution.
pub trait ExecutorFactory: Send + Sync {
    /// Registry key, e.g. `"aggregate_results_executor"`.
    fn id(&self) -> &str;

    /// Secondary lookup key matched against `schemas.type`.
    fn kind(&self) -> &str;

    /// Build an instance for one task execution.
    fn build(&self, ctx: ExecutorContext) -> Result<Arc<dyn Executor>>;
}

// Compile-time assertion: Executor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Executor) {}
    fn _assert_factory_object_safe(_: &dyn ExecutorFactory) {}
};

impl std::fmt::Debug for dyn ExecutorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorFactory")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}
