//! Aggregates dependency task results into a single result.
//!
//! Dependency resolution merges each dependency's result into the task's
//! inputs keyed by the dependency task id before this executor runs; this
//! executor folds all of those entries into one structured mapping. No
//! filtering is applied; callers needing selection implement their own
//! aggregator.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use taskforge_db::models::JsonMap;

use crate::executor::{Executor, ExecutorContext, ExecutorFactory};

pub struct AggregateResultsExecutor;

#[async_trait]
impl Executor for AggregateResultsExecutor {
    async fn execute(&self, inputs: &JsonMap) -> Result<Value> {
        debug!(result_count = inputs.len(), "aggregating dependency results");
        Ok(json!({
            "summary": "Task Results Aggregation",
            "timestamp": Utc::now().to_rfc3339(),
            "results": Value::Object(inputs.clone()),
            "result_count": inputs.len(),
        }))
    }
}

pub struct AggregateResultsFactory;

impl ExecutorFactory for AggregateResultsFactory {
    fn id(&self) -> &str {
        "aggregate_results_executor"
    }

    fn kind(&self) -> &str {
        "core"
    }

    fn build(&self, _ctx: ExecutorContext) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(AggregateResultsExecutor))
    }
}
