//! Shared fixtures for taskforge-core integration tests.
//!
//! These tests require Docker (testcontainers) or an external PostgreSQL
//! reachable through `TASKFORGE_TEST_PG_URL`. Each test gets its own
//! database, dropped on teardown.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::PgPool;
use tokio::sync::Notify;

use taskforge_core::executor::{
    CancelOutcome, Executor, ExecutorContext, ExecutorFactory, ExecutorRegistry, RegistryBuilder,
};
use taskforge_core::facade::TaskService;
use taskforge_core::hooks::HookSet;
use taskforge_db::config::DbConfig;
use taskforge_db::models::JsonMap;
use taskforge_db::session::SessionPool;
use taskforge_test_utils::{create_test_db, drop_test_db, init_tracing};

/// One test's world: its own database, session pool, and service.
pub struct TestEnv {
    pub db_name: String,
    pub pool: PgPool,
    pub sessions: Arc<SessionPool>,
    pub service: Arc<TaskService>,
}

impl TestEnv {
    pub async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

/// Environment with the built-in executors only.
pub async fn env() -> TestEnv {
    env_with(RegistryBuilder::new().with_builtins().build()).await
}

/// Environment with a caller-supplied executor registry.
pub async fn env_with(registry: Arc<ExecutorRegistry>) -> TestEnv {
    init_tracing();
    let (pool, db_name) = create_test_db().await;
    let config = DbConfig::new("postgresql://unused/unused");
    let sessions = SessionPool::new(pool.clone(), &config);
    let service = TaskService::new(
        Arc::clone(&sessions),
        registry,
        HookSet::new().build(),
    );
    TestEnv {
        db_name,
        pool,
        sessions,
        service,
    }
}

pub fn object(value: Value) -> JsonMap {
    value.as_object().cloned().expect("object literal")
}

// ---------------------------------------------------------------------------
// Test executors
// ---------------------------------------------------------------------------

/// Start-time log shared between a recording executor and its test.
#[derive(Debug, Default)]
pub struct Recorder {
    entries: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, label: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((label.to_owned(), Utc::now()));
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }
}

/// Echoes inputs like the stdio executor but records each invocation's
/// `label` input and start time.
pub struct RecordingExecutor {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, inputs: &JsonMap) -> Result<Value> {
        let label = inputs
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("unlabelled");
        self.recorder.record(label);
        Ok(Value::Object(inputs.clone()))
    }
}

pub struct RecordingFactory {
    pub recorder: Arc<Recorder>,
}

impl ExecutorFactory for RecordingFactory {
    fn id(&self) -> &str {
        "recording_executor"
    }

    fn kind(&self) -> &str {
        "stdio"
    }

    fn build(&self, _ctx: ExecutorContext) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(RecordingExecutor {
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

/// Counts how many executor instances actually ran.
#[derive(Default)]
pub struct InvocationCounter(AtomicUsize);

impl InvocationCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct CountingExecutor {
    counter: Arc<InvocationCounter>,
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(&self, inputs: &JsonMap) -> Result<Value> {
        self.counter.0.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Object(inputs.clone()))
    }
}

pub struct CountingFactory {
    pub counter: Arc<InvocationCounter>,
}

impl ExecutorFactory for CountingFactory {
    fn id(&self) -> &str {
        "counting_executor"
    }

    fn kind(&self) -> &str {
        "stdio"
    }

    fn build(&self, _ctx: ExecutorContext) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(CountingExecutor {
            counter: Arc::clone(&self.counter),
        }))
    }
}

/// Always fails; for failure-containment tests.
pub struct FailingExecutor;

#[async_trait]
impl Executor for FailingExecutor {
    async fn execute(&self, _inputs: &JsonMap) -> Result<Value> {
        anyhow::bail!("intentional failure")
    }
}

pub struct FailingFactory;

impl ExecutorFactory for FailingFactory {
    fn id(&self) -> &str {
        "failing_executor"
    }

    fn kind(&self) -> &str {
        "test"
    }

    fn build(&self, _ctx: ExecutorContext) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(FailingExecutor))
    }
}

/// A cancelable executor that blocks until cancelled (or a safety
/// timeout) and hands back token usage plus a partial result.
pub struct CancelProbe {
    pub started: Arc<Notify>,
    pub cancel_signal: Arc<Notify>,
}

impl CancelProbe {
    pub fn new() -> (Arc<Notify>, Arc<Notify>, CancelProbeFactory) {
        let started = Arc::new(Notify::new());
        let cancel_signal = Arc::new(Notify::new());
        let factory = CancelProbeFactory {
            started: Arc::clone(&started),
            cancel_signal: Arc::clone(&cancel_signal),
        };
        (started, cancel_signal, factory)
    }
}

#[async_trait]
impl Executor for CancelProbe {
    async fn execute(&self, _inputs: &JsonMap) -> Result<Value> {
        self.started.notify_one();
        tokio::select! {
            _ = self.cancel_signal.notified() => Ok(json!({"status": "interrupted"})),
            _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {
                Ok(json!({"status": "timed_out"}))
            }
        }
    }

    fn cancelable(&self) -> bool {
        true
    }

    async fn cancel(&self) -> Option<CancelOutcome> {
        self.cancel_signal.notify_one();
        Some(CancelOutcome {
            token_usage: Some(json!({"total_tokens": 100})),
            partial_result: Some(json!({"partial": "x"})),
        })
    }
}

pub struct CancelProbeFactory {
    pub started: Arc<Notify>,
    pub cancel_signal: Arc<Notify>,
}

impl ExecutorFactory for CancelProbeFactory {
    fn id(&self) -> &str {
        "cancel_probe"
    }

    fn kind(&self) -> &str {
        "test"
    }

    fn build(&self, _ctx: ExecutorContext) -> Result<Arc<dyn Executor>> {
        Ok(Arc::new(CancelProbe {
            started: Arc::clone(&self.started),
            cancel_signal: Arc::clone(&self.cancel_signal),
        }))
    }
}
