//! RPC-handler tests: the typed surface protocol adapters call into.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::env;
use taskforge_core::api::{
    Api, CancelParams, ChildrenParams, CopyParams, CreateParams, ExecuteParams, ListParams,
    TaskIdParams, TreeParams, UpdateParams,
};
use taskforge_core::streaming::EventKind;
use taskforge_db::models::TaskStatus;
use taskforge_db::repository::{self, StatusUpdate};

fn params<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).expect("valid params")
}

#[tokio::test]
async fn create_returns_nested_tree() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    let tree = api
        .handle_create(params(json!([
            {"id": "r", "name": "R", "user_id": "u-1"},
            {"id": "k", "name": "K", "parent_id": "r", "user_id": "u-1"}
        ])))
        .await
        .expect("create");

    assert_eq!(tree["id"], "r");
    assert_eq!(tree["status"], "pending");
    assert_eq!(tree["children"][0]["id"], "k");

    env.teardown().await;
}

#[tokio::test]
async fn create_accepts_single_task_mapping() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    let tree = api
        .handle_create(params(json!({"name": "solo"})))
        .await
        .expect("create");
    assert_eq!(tree["name"], "solo");
    assert!(tree.get("children").is_none());

    env.teardown().await;
}

#[tokio::test]
async fn create_rejects_mixed_user_ids() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    let err = api
        .handle_create(params(json!([
            {"id": "a", "name": "A", "user_id": "u-1"},
            {"id": "b", "name": "B", "parent_id": "a", "user_id": "u-2"}
        ])))
        .await
        .expect_err("mixed user ids");
    assert!(err.to_string().contains("user_id"), "{err}");

    env.teardown().await;
}

#[tokio::test]
async fn get_tree_list_children_roundtrip() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!([
        {"id": "r", "name": "R", "user_id": "owner"},
        {"id": "c1", "name": "C1", "parent_id": "r", "user_id": "owner"},
        {"id": "c2", "name": "C2", "parent_id": "r", "user_id": "owner"}
    ])))
    .await
    .expect("create");

    // tasks.get
    let task = api
        .handle_get(params::<TaskIdParams>(json!({"task_id": "c1"})))
        .await
        .expect("get")
        .expect("found");
    assert_eq!(task["name"], "C1");

    let missing = api
        .handle_get(params::<TaskIdParams>(json!({"task_id": "nope"})))
        .await
        .expect("get");
    assert!(missing.is_none());

    // tasks.tree from a mid-tree node walks up to the root.
    let tree = api
        .handle_tree(params::<TreeParams>(json!({"task_id": "c2"})))
        .await
        .expect("tree");
    assert_eq!(tree["id"], "r");
    assert_eq!(tree["children"].as_array().unwrap().len(), 2);

    // tasks.list with root_only=true covers exactly the root.
    let listed = api
        .handle_list(params::<ListParams>(json!({"user_id": "owner"})))
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "r");

    // Without root_only, all three are visible.
    let all = api
        .handle_list(params::<ListParams>(json!({"user_id": "owner", "root_only": false})))
        .await
        .expect("list all");
    assert_eq!(all.len(), 3);

    // tasks.children
    let children = api
        .handle_children(params::<ChildrenParams>(json!({"parent_id": "r"})))
        .await
        .expect("children");
    assert_eq!(children.len(), 2);

    env.teardown().await;
}

#[tokio::test]
async fn update_writes_only_writable_fields() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!({"id": "t", "name": "T"})))
        .await
        .expect("create");

    let updated = api
        .handle_update(params::<UpdateParams>(json!({
            "task_id": "t",
            "status": "in_progress",
            "progress": 0.25,
            "inputs": {"mode": "manual"}
        })))
        .await
        .expect("update");

    assert_eq!(updated["status"], "in_progress");
    assert_eq!(updated["progress"], 0.25);
    assert_eq!(updated["inputs"]["mode"], "manual");
    // Untouched fields stay as they were.
    assert_eq!(updated["name"], "T");
    assert!(updated["error"].is_null());

    env.teardown().await;
}

#[tokio::test]
async fn delete_refuses_non_pending_descendants() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!([
        {"id": "root", "name": "Root"},
        {"id": "busy", "name": "Busy", "parent_id": "root"}
    ])))
    .await
    .expect("create");

    repository::update_task_status(
        &env.pool,
        "busy",
        StatusUpdate::to(TaskStatus::InProgress),
    )
    .await
    .expect("mark busy");

    let err = api
        .handle_delete(params::<TaskIdParams>(json!({"task_id": "root"})))
        .await
        .expect_err("refused");
    let message = err.to_string();
    assert!(message.contains("busy"), "names the offender: {message}");
    assert!(message.contains("in_progress"), "names its status: {message}");

    // Nothing was deleted.
    assert!(repository::get_task_by_id(&env.pool, "root").await.unwrap().is_some());
    assert!(repository::get_task_by_id(&env.pool, "busy").await.unwrap().is_some());

    env.teardown().await;
}

#[tokio::test]
async fn delete_removes_pending_subtree_and_reports_count() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!([
        {"id": "root", "name": "Root"},
        {"id": "a", "name": "A", "parent_id": "root"},
        {"id": "b", "name": "B", "parent_id": "a"}
    ])))
    .await
    .expect("create");

    let response = api
        .handle_delete(params::<TaskIdParams>(json!({"task_id": "a"})))
        .await
        .expect("delete");
    assert!(response.success);
    assert_eq!(response.deleted_count, 2);

    assert!(repository::get_task_by_id(&env.pool, "a").await.unwrap().is_none());
    assert!(repository::get_task_by_id(&env.pool, "b").await.unwrap().is_none());

    // The parent's derived flag is repaired.
    let root = repository::require_task(&env.pool, "root").await.unwrap();
    assert!(!root.has_children);

    env.teardown().await;
}

#[tokio::test]
async fn execute_non_streaming_detaches_and_reports_started() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!({"id": "job", "name": "Job"})))
        .await
        .expect("create");

    let response = api
        .handle_execute(params::<ExecuteParams>(json!({"task_id": "job"})))
        .await
        .expect("execute");
    assert!(response.success);
    assert_eq!(response.status, "started");
    assert_eq!(response.root_task_id, "job");
    assert_eq!(response.protocol, "jsonrpc");
    assert!(response.streaming.is_none());

    // The background run finishes shortly after.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let task = repository::require_task(&env.pool, "job").await.unwrap();
        if task.status == TaskStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "background execution should complete, still {}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    env.teardown().await;
}

#[tokio::test]
async fn execute_streaming_buffers_ordered_events_with_final() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!([
        {"id": "sroot", "name": "SRoot"},
        {"id": "skid", "name": "SKid", "parent_id": "sroot"}
    ])))
    .await
    .expect("create");

    let response = api
        .handle_execute(params::<ExecuteParams>(json!({
            "task_id": "sroot",
            "use_streaming": true
        })))
        .await
        .expect("execute");
    assert_eq!(response.streaming, Some(true));
    assert_eq!(response.events_url.as_deref(), Some("/events?task_id=sroot"));

    let events = api.handle_events(params::<TaskIdParams>(json!({"task_id": "sroot"})));
    assert!(!events.is_empty());

    // Ordered append with a terminal final event.
    assert_eq!(events.first().unwrap().kind, EventKind::Progress);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Final);
    assert!(last.is_final);
    assert_eq!(last.status.as_deref(), Some("completed"));

    let starts = events.iter().filter(|e| e.kind == EventKind::TaskStart).count();
    let completions = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskCompleted)
        .count();
    assert_eq!(starts, 2, "one start per task");
    assert_eq!(completions, 2, "one completion per task");

    env.teardown().await;
}

#[tokio::test]
async fn copy_handler_returns_clone_tree_and_rejects_unsaved() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!([
        {"id": "r", "name": "R"},
        {"id": "k", "name": "K", "parent_id": "r"}
    ])))
    .await
    .expect("create");

    let clone = api
        .handle_copy(params::<CopyParams>(json!({"task_id": "r"})))
        .await
        .expect("copy");
    assert_eq!(clone["name"], "R");
    assert_eq!(clone["original_task_id"], "r");
    assert_eq!(clone["children"][0]["name"], "K");

    let err = api
        .handle_copy(params::<CopyParams>(json!({"task_id": "r", "save": false})))
        .await
        .expect_err("save=false unsupported");
    assert!(err.to_string().contains("save=false"));

    env.teardown().await;
}

#[tokio::test]
async fn cancel_handler_reports_per_task() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    api.handle_create(params(json!({"id": "p", "name": "P"})))
        .await
        .expect("create");

    let reports = api
        .handle_cancel(params::<CancelParams>(json!({
            "task_ids": ["p", "missing"],
            "force": true
        })))
        .await
        .expect("cancel");

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].status, "cancelled");
    assert_eq!(reports[0].message, "Force cancelled by user");
    assert_eq!(reports[1].status, "failed");

    env.teardown().await;
}

#[tokio::test]
async fn running_handlers_reflect_tracker() {
    let env = env().await;
    let api = Api::new(Arc::clone(&env.service));

    assert_eq!(api.handle_running_count().count, 0);
    assert!(api.handle_running_list().is_empty());
    assert!(api.handle_running_status().await.expect("status").is_empty());

    env.teardown().await;
}
