//! Cancellation protocol tests: mid-flight cancellation with a cancelable
//! executor, terminal no-ops, and pending cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{CancelProbe, env, env_with};
use taskforge_core::creator::TaskSpec;
use taskforge_core::executor::RegistryBuilder;
use taskforge_db::models::TaskStatus;
use taskforge_db::repository;

fn spec(value: serde_json::Value) -> TaskSpec {
    serde_json::from_value(value).expect("valid task spec")
}

#[tokio::test]
async fn cancel_midflight_folds_partial_result_and_token_usage() {
    let (started, _cancel_signal, factory) = CancelProbe::new();
    let registry = RegistryBuilder::new().register_extension(factory).build();
    let env = env_with(registry).await;

    env.service
        .create_task_tree(&[spec(json!({
            "id": "slow", "name": "Slow",
            "params": {"executor_id": "cancel_probe"}
        }))])
        .await
        .expect("create");

    let service = Arc::clone(&env.service);
    let run = tokio::spawn(async move {
        service.execute_existing_tasks(&["slow".to_owned()]).await
    });

    // Wait until the executor is actually in flight, then cancel.
    tokio::time::timeout(Duration::from_secs(30), started.notified())
        .await
        .expect("executor should start");
    let reports = env
        .service
        .cancel_tasks(&["slow".to_owned()], None)
        .await
        .expect("cancel");

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.status, "cancelled");
    assert_eq!(report.task_id, "slow");
    assert_eq!(
        report.token_usage.as_ref().unwrap()["total_tokens"],
        100
    );
    assert_eq!(report.result.as_ref().unwrap()["partial"], "x");

    run.await.expect("join").expect("run returns cleanly");

    // The persisted row keeps the cancelled status with the partial
    // result and token usage folded in.
    let row = repository::require_task(&env.pool, "slow").await.unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
    assert_eq!(row.error.as_deref(), Some("Cancelled by user"));
    let result = row.result_value().expect("folded result");
    assert_eq!(result["partial"], "x");
    assert_eq!(result["token_usage"]["total_tokens"], 100);

    env.teardown().await;
}

#[tokio::test]
async fn cancelling_terminal_task_is_a_noop_reporting_current_status() {
    let env = env().await;

    let specs = vec![spec(json!({"id": "done", "name": "Done"}))];
    env.service.execute_task_specs(&specs).await.expect("run");

    let reports = env
        .service
        .cancel_tasks(&["done".to_owned()], None)
        .await
        .expect("cancel call itself succeeds");

    let report = &reports[0];
    assert_eq!(report.status, "failed");
    assert!(report.message.contains("already completed"), "{}", report.message);
    assert_eq!(report.current_status, Some(TaskStatus::Completed));

    // The row is untouched.
    let row = repository::require_task(&env.pool, "done").await.unwrap();
    assert_eq!(row.status, TaskStatus::Completed);
    assert!(row.error.is_none());

    env.teardown().await;
}

#[tokio::test]
async fn cancelling_pending_task_marks_it_cancelled() {
    let env = env().await;

    env.service
        .create_task_tree(&[spec(json!({"id": "idle", "name": "Idle"}))])
        .await
        .expect("create");

    let reports = env
        .service
        .cancel_tasks(&["idle".to_owned()], Some("operator abort"))
        .await
        .expect("cancel");
    assert_eq!(reports[0].status, "cancelled");
    assert_eq!(reports[0].message, "operator abort");

    let row = repository::require_task(&env.pool, "idle").await.unwrap();
    assert_eq!(row.status, TaskStatus::Cancelled);
    assert_eq!(row.error.as_deref(), Some("operator abort"));
    assert!(row.completed_at.is_some());

    env.teardown().await;
}

#[tokio::test]
async fn cancelling_unknown_task_reports_not_found() {
    let env = env().await;

    let reports = env
        .service
        .cancel_tasks(&["ghost".to_owned()], None)
        .await
        .expect("cancel");
    assert_eq!(reports[0].status, "failed");
    assert!(reports[0].message.contains("not found"));

    env.teardown().await;
}
