//! Built-in executors shipped with the engine.

mod aggregate;
mod echo;

pub use aggregate::{AggregateResultsExecutor, AggregateResultsFactory};
pub use echo::{EchoExecutor, EchoExecutorFactory};
