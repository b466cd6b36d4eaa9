use serde_json::json;
use wdn_commands::{CommandEntry, CommandResult, CommandStore, ExecutionMode, Status};

async fn open_store() -> (tempfile::TempDir, CommandStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CommandStore::open(dir.path()).await.expect("open");
    (dir, store)
}

fn set_group(id: &str) -> CommandEntry {
    let mut entry = CommandEntry::new(
        id,
        "command_handler",
        "set-group",
        json!({"groups": ["g1", "g2"]}),
        ExecutionMode::Async,
    );
    entry.result = CommandResult::new(Status::InProgress, String::new());
    entry
}

#[tokio::test]
async fn store_then_update_preserves_identity() {
    let (_dir, store) = open_store().await;

    assert!(store.store(&set_group("c1")).await);

    let mut update = set_group("c1");
    update.result = CommandResult::new(Status::Success, "Group updated".to_string());
    assert!(store.update(&update).await);

    let fetched = store.get("c1").await.expect("entry exists");
    assert_eq!(fetched.result.status, Status::Success);
    assert_eq!(fetched.result.message, "Group updated");
    assert_eq!(fetched.module, "command_handler");
    assert_eq!(fetched.command, "set-group");
    assert_eq!(fetched.parameters, json!({"groups": ["g1", "g2"]}));
    assert_eq!(fetched.execution_mode, ExecutionMode::Async);
    assert!(fetched.time > 0.0);
}

#[tokio::test]
async fn update_with_unknown_status_leaves_status_untouched() {
    let (_dir, store) = open_store().await;
    store.store(&set_group("c1")).await;

    let mut update = CommandEntry::new("c1", "", "", serde_json::Value::Null, ExecutionMode::Async);
    update.result = CommandResult::new(Status::Unknown, "note only".to_string());
    assert!(store.update(&update).await);

    let fetched = store.get("c1").await.expect("entry exists");
    assert_eq!(fetched.result.status, Status::InProgress);
    assert_eq!(fetched.result.message, "note only");
}

#[tokio::test]
async fn get_by_status_returns_none_when_empty() {
    let (_dir, store) = open_store().await;
    assert!(store.get_by_status(Status::InProgress).await.is_none());

    store.store(&set_group("c1")).await;
    store.store(&set_group("c2")).await;

    let in_progress = store.get_by_status(Status::InProgress).await.expect("rows");
    assert_eq!(in_progress.len(), 2);
    assert!(store.get_by_status(Status::Timeout).await.is_none());
}

#[tokio::test]
async fn execution_mode_roundtrips_through_integers() {
    let (_dir, store) = open_store().await;

    let mut sync_cmd = set_group("sync");
    sync_cmd.execution_mode = ExecutionMode::Sync;
    store.store(&sync_cmd).await;
    store.store(&set_group("async")).await;

    assert_eq!(
        store.get("sync").await.unwrap().execution_mode,
        ExecutionMode::Sync
    );
    assert_eq!(
        store.get("async").await.unwrap().execution_mode,
        ExecutionMode::Async
    );
}

#[tokio::test]
async fn delete_count_and_clear() {
    let (_dir, store) = open_store().await;
    store.store(&set_group("c1")).await;
    store.store(&set_group("c2")).await;
    assert_eq!(store.count().await, 2);

    assert!(store.delete("c1").await);
    assert_eq!(store.count().await, 1);
    assert!(store.get("c1").await.is_none());

    assert!(store.clear().await);
    assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn duplicate_id_is_rejected_by_primary_key() {
    let (_dir, store) = open_store().await;
    assert!(store.store(&set_group("c1")).await);
    assert!(!store.store(&set_group("c1")).await);
    assert_eq!(store.count().await, 1);
}
