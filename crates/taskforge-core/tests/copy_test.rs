//! Copy-engine tests: minimal enclosing subtree, dependent closure,
//! failure-aware filtering, and original/copy linkage.

mod common;

use serde_json::json;

use common::env;
use taskforge_core::copy::{CopyOptions, create_task_copy};
use taskforge_core::creator::TaskSpec;
use taskforge_db::models::{TaskStatus, StoredDependency};
use taskforge_db::repository::{self, StatusUpdate};

fn spec(value: serde_json::Value) -> TaskSpec {
    serde_json::from_value(value).expect("valid task spec")
}

async fn set_status(pool: &sqlx::PgPool, id: &str, status: TaskStatus) {
    repository::update_task_status(pool, id, StatusUpdate::to(status))
        .await
        .expect("status update");
}

#[tokio::test]
async fn copy_with_failed_leaf_drops_pending_dependents() {
    let env = env().await;

    // R with completed c1, failed leaf c2, and pending c3 depending on c2.
    env.service
        .create_task_tree(&[
            spec(json!({"id": "r", "name": "R"})),
            spec(json!({"id": "c1", "name": "C1", "parent_id": "r"})),
            spec(json!({"id": "c2", "name": "C2", "parent_id": "r"})),
            spec(json!({
                "id": "c3", "name": "C3", "parent_id": "r",
                "dependencies": [{"id": "c2"}]
            })),
        ])
        .await
        .expect("create");
    set_status(&env.pool, "c1", TaskStatus::Completed).await;
    set_status(&env.pool, "c2", TaskStatus::Failed).await;

    let original = repository::require_task(&env.pool, "r").await.unwrap();
    let clone_tree = create_task_copy(&env.pool, &original, CopyOptions::default())
        .await
        .expect("copy");

    // Clones of R, C1, C2 -- the pending dependent C3 stays behind.
    let mut clone_names: Vec<&str> = clone_tree.tasks().iter().map(|t| t.name.as_str()).collect();
    clone_names.sort_unstable();
    assert_eq!(clone_names, vec!["C1", "C2", "R"]);

    for clone in clone_tree.tasks() {
        assert_eq!(clone.status, TaskStatus::Pending);
        assert_eq!(clone.original_task_id.as_deref(), Some("r"));
        assert!(clone.result.is_none());
        assert!(clone.started_at.is_none());
        assert!((clone.progress).abs() < f64::EPSILON);
    }

    // Originals covered by the copy are marked; C3 is not.
    for (id, expected) in [("r", true), ("c1", true), ("c2", true), ("c3", false)] {
        let task = repository::require_task(&env.pool, id).await.unwrap();
        assert_eq!(task.has_copy, expected, "has_copy for {id}");
    }

    env.teardown().await;
}

#[tokio::test]
async fn copy_pulls_in_dependent_closure_and_remaps_dependencies() {
    let env = env().await;

    // R -> (A -> B, C); C depends on A. Copying A must pull in C (its
    // dependent) and therefore R (to keep the tree connected).
    env.service
        .create_task_tree(&[
            spec(json!({"id": "r", "name": "R"})),
            spec(json!({"id": "a", "name": "A", "parent_id": "r"})),
            spec(json!({"id": "b", "name": "B", "parent_id": "a"})),
            spec(json!({
                "id": "c", "name": "C", "parent_id": "r",
                "dependencies": [{"id": "a"}]
            })),
        ])
        .await
        .expect("create");

    let original = repository::require_task(&env.pool, "a").await.unwrap();
    let clone_tree = create_task_copy(&env.pool, &original, CopyOptions::default())
        .await
        .expect("copy");

    assert_eq!(clone_tree.len(), 4, "R, A, B, C all cloned");
    assert_eq!(clone_tree.root().name, "R");

    // Shape preserved: clone-A has clone-B under it, clone-C is a sibling.
    let clone_a = clone_tree
        .tasks()
        .iter()
        .find(|t| t.name == "A")
        .expect("clone of A");
    let clone_b = clone_tree
        .tasks()
        .iter()
        .find(|t| t.name == "B")
        .expect("clone of B");
    assert_eq!(clone_b.parent_id.as_deref(), Some(clone_a.id.as_str()));

    // C's dependency edge is rewritten onto the clone of A.
    let clone_c = clone_tree
        .tasks()
        .iter()
        .find(|t| t.name == "C")
        .expect("clone of C");
    let deps = clone_c.dependency_list();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].id(), clone_a.id, "dependency remapped to the clone");
    assert!(matches!(deps[0], StoredDependency::Record(_)));

    env.teardown().await;
}

#[tokio::test]
async fn copying_a_leaf_clones_just_that_node() {
    let env = env().await;

    env.service
        .create_task_tree(&[
            spec(json!({"id": "r", "name": "R"})),
            spec(json!({"id": "leaf", "name": "Leaf", "parent_id": "r",
                        "inputs": {"keep": "me"}})),
        ])
        .await
        .expect("create");

    let original = repository::require_task(&env.pool, "leaf").await.unwrap();
    let clone_tree = create_task_copy(&env.pool, &original, CopyOptions::default())
        .await
        .expect("copy");

    assert_eq!(clone_tree.len(), 1);
    let clone = clone_tree.root();
    assert_eq!(clone.name, "Leaf");
    assert!(clone.parent_id.is_none(), "clone is detached from the original tree");
    assert_eq!(clone.original_task_id.as_deref(), Some("leaf"));
    assert_eq!(clone.inputs_map()["keep"], "me");
    assert_ne!(clone.id, "leaf");

    let original = repository::require_task(&env.pool, "leaf").await.unwrap();
    assert!(original.has_copy);

    env.teardown().await;
}

#[tokio::test]
async fn children_option_is_accepted() {
    let env = env().await;

    env.service
        .create_task_tree(&[
            spec(json!({"id": "r", "name": "R"})),
            spec(json!({"id": "k1", "name": "K1", "parent_id": "r"})),
            spec(json!({"id": "k2", "name": "K2", "parent_id": "r"})),
        ])
        .await
        .expect("create");

    let original = repository::require_task(&env.pool, "r").await.unwrap();
    let clone_tree = create_task_copy(&env.pool, &original, CopyOptions { children: true })
        .await
        .expect("copy");

    assert_eq!(clone_tree.len(), 3);
    assert!(clone_tree.root().has_children);

    env.teardown().await;
}
