use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;
use wdn_commands::{
    CommandEntry, CommandHandler, CommandResult, CommandStore, ExecutionMode, Status,
};

struct Harness {
    handler: Arc<CommandHandler>,
    queue: Arc<Mutex<VecDeque<CommandEntry>>>,
    reported: Arc<Mutex<Vec<CommandEntry>>>,
}

async fn harness(dir: &tempfile::TempDir, pending: Vec<CommandEntry>) -> Harness {
    let store = CommandStore::open(dir.path()).await.expect("open store");
    Harness {
        handler: Arc::new(CommandHandler::new(store)),
        queue: Arc::new(Mutex::new(pending.into())),
        reported: Arc::new(Mutex::new(Vec::new())),
    }
}

/// Drives the dispatch loop until the queue drains, then stops it.
async fn run_to_drain<D, DF>(h: &Harness, dispatch: D)
where
    D: Fn(CommandEntry) -> DF,
    DF: std::future::Future<Output = CommandResult>,
{
    let get = {
        let queue = Arc::clone(&h.queue);
        let handler = Arc::clone(&h.handler);
        move || {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            async move {
                let next = queue.lock().unwrap().front().cloned();
                if next.is_none() {
                    handler.stop();
                }
                next
            }
        }
    };
    let pop = {
        let queue = Arc::clone(&h.queue);
        move || {
            let queue = Arc::clone(&queue);
            async move {
                queue.lock().unwrap().pop_front();
            }
        }
    };
    let report = {
        let reported = Arc::clone(&h.reported);
        move |entry: CommandEntry| {
            let reported = Arc::clone(&reported);
            async move {
                reported.lock().unwrap().push(entry);
            }
        }
    };

    h.handler.process_commands(get, pop, report, dispatch).await;
}

fn command(id: &str, name: &str, parameters: serde_json::Value) -> CommandEntry {
    CommandEntry::new(id, "command_handler", name, parameters, ExecutionMode::Async)
}

#[tokio::test]
async fn valid_command_is_stored_dispatched_and_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        &dir,
        vec![command("c1", "set-group", json!({"groups": ["g1", "g2"]}))],
    )
    .await;

    let dispatched = Arc::new(Mutex::new(Vec::new()));
    let dispatched_in = Arc::clone(&dispatched);
    run_to_drain(&h, move |entry| {
        let dispatched = Arc::clone(&dispatched_in);
        async move {
            dispatched.lock().unwrap().push(entry.id.clone());
            CommandResult::new(Status::Success, "Group updated".to_string())
        }
    })
    .await;

    assert_eq!(dispatched.lock().unwrap().as_slice(), ["c1"]);

    let reported = h.reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].result.status, Status::Success);

    let stored = h.handler.store().get("c1").await.expect("persisted");
    assert_eq!(stored.result.status, Status::Success);
    assert!(h.queue.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_parameters_fail_without_being_stored() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, vec![command("c1", "set-group", json!({}))]).await;

    run_to_drain(&h, |_entry| async {
        panic!("invalid command must not be dispatched")
    })
    .await;

    let reported = h.reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].result.status, Status::Failure);

    // Never persisted: validation failed before the store step.
    assert!(h.handler.store().get("c1").await.is_none());
    assert!(h.queue.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_command_is_popped_and_reported_failed() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, vec![command("c1", "self-destruct", json!({}))]).await;

    run_to_drain(&h, |_entry| async {
        panic!("unknown command must not be dispatched")
    })
    .await;

    let reported = h.reported.lock().unwrap();
    assert_eq!(reported[0].result.status, Status::Failure);
    assert!(reported[0].result.message.contains("not recognized"));
}

#[tokio::test]
async fn dispatch_failure_is_persisted_as_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&dir, vec![command("c1", "restart", json!({}))]).await;

    run_to_drain(&h, |_entry| async {
        CommandResult::new(Status::Failure, "restart refused".to_string())
    })
    .await;

    let stored = h.handler.store().get("c1").await.expect("persisted");
    assert_eq!(stored.result.status, Status::Failure);
    assert_eq!(stored.result.message, "restart refused");
}

#[tokio::test]
async fn startup_recovery_resolves_orphaned_in_progress_entries() {
    let dir = tempfile::tempdir().unwrap();

    // Seed the store the way a crashed process would have left it.
    {
        let store = CommandStore::open(dir.path()).await.unwrap();
        let mut orphan = command("c2", "set-group", json!({"groups": ["g1"]}));
        orphan.result = CommandResult::new(Status::InProgress, String::new());
        assert!(store.store(&orphan).await);
    }

    let h = harness(&dir, Vec::new()).await;
    run_to_drain(&h, |_entry| async {
        CommandResult::new(Status::Success, String::new())
    })
    .await;

    let reported = h.reported.lock().unwrap();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].id, "c2");
    assert_eq!(reported[0].result.status, Status::Failure);

    let stored = h.handler.store().get("c2").await.expect("persisted");
    assert_ne!(stored.result.status, Status::InProgress);
}
