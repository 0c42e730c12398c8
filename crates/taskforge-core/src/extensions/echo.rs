//! The default `stdio`-kind executor: returns its resolved inputs as the
//! task result. Makes plain data-passing trees executable without any
//! caller-registered executor.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use taskforge_db::models::JsonMap;

use crate::executor::{Executor, ExecutorContext, ExecutorFactory};

pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, inputs: &JsonMap) -> Result<Value> {
        Ok(Value::Object(inputs.clone()))
    }
}

pub struct EchoExecutorFactory;

impl ExecutorFactory for EchoExecutorFactory {
    fn id(&self) -> &str {
        "echo_executor"
    }

    fn kind(&self) -> &str {
        "stdio"
    }

    fn build(&self, _ctx: ExecutorContext) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(EchoExecutor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_inputs() {
        let executor = EchoExecutor;
        let inputs = json!({"url": "https://example.com", "n": 3})
            .as_object()
            .cloned()
            .unwrap();
        let result = executor.execute(&inputs).await.unwrap();
        assert_eq!(result["url"], "https://example.com");
        assert_eq!(result["n"], 3);
    }

    #[test]
    fn factory_identity() {
        let factory = EchoExecutorFactory;
        assert_eq!(factory.id(), "echo_executor");
        assert_eq!(factory.kind(), "stdio");
    }
}
