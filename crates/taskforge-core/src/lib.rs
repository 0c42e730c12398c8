//! taskforge-core: the task-graph orchestration engine.
//!
//! Ingests a declarative task array into a persisted rooted tree, then
//! executes each node through pluggable executors while honouring
//! parent/child structure, inter-task data dependencies, priority
//! ordering, hooks, cancellation, and progress streaming.

pub mod api;
pub mod copy;
pub mod creator;
pub mod error;
pub mod executor;
pub mod extensions;
pub mod facade;
pub mod hooks;
pub mod manager;
pub mod streaming;
pub mod tracker;

pub use api::Api;
pub use creator::{DependencyRef, TaskSpec};
pub use error::ValidationError;
pub use executor::{
    CancelOutcome, CancellationChecker, Executor, ExecutorContext, ExecutorFactory,
    ExecutorRegistry, RegistryBuilder,
};
pub use facade::{ExecuteOptions, ExecuteResponse, ExecutionSummary, TaskService};
pub use hooks::{HookSet, PostHook, PreHook};
pub use manager::{CancelReport, TaskManager};
pub use streaming::{EventKind, EventSink, EventStore, ProgressEvent, WebhookConfig};
pub use tracker::TaskTracker;
