mod harness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use wdn_agent::executor::{CommandExecutor, RestartHandle};
use wdn_agent::pipeline;
use wdn_commands::{CommandHandler, CommandStore, Status};
use wdn_queue::MessageType;
use wdn_testkit::MockManager;

struct Pipeline {
    queue: Arc<wdn_queue::MultiTypeQueue>,
    comm: Arc<wdn_communicator::Communicator>,
    handler: Arc<CommandHandler>,
    restart: Arc<RestartHandle>,
    reload_rx: mpsc::UnboundedReceiver<Option<String>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Wires the full command path the way the agent binary does: commands poll
/// → command buffer → dispatch loop → executor → result into the stateful
/// buffer.
async fn start_pipeline(manager: &MockManager, dir: &tempfile::TempDir) -> Pipeline {
    let settings = harness::settings(dir.path(), &manager.url());
    std::fs::create_dir_all(&settings.data_path).unwrap();

    let queue = harness::open_queue(&settings.data_path).await;
    let comm = harness::communicator(&manager.url());
    assert!(comm.send_authentication_request().await.unwrap());

    let store = CommandStore::open(&settings.data_path).await.unwrap();
    let handler = Arc::new(CommandHandler::new(store));

    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let restart = Arc::new(RestartHandle::new());
    let executor = Arc::new(CommandExecutor::new(
        Arc::clone(&comm),
        &settings,
        reload_tx,
        Arc::clone(&restart),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn({
        let comm = Arc::clone(&comm);
        let enqueue = pipeline::enqueue_commands(Arc::clone(&queue));
        async move { comm.get_commands_from_manager(enqueue).await }
    }));
    tasks.push(tokio::spawn({
        let handler = Arc::clone(&handler);
        let get = pipeline::command_supplier(Arc::clone(&queue));
        let pop = pipeline::command_popper(Arc::clone(&queue));
        let report = pipeline::report_to_stateful(Arc::clone(&queue));
        async move {
            handler
                .process_commands(get, pop, report, move |entry| {
                    let executor = Arc::clone(&executor);
                    async move { executor.dispatch(entry).await }
                })
                .await
        }
    }));

    Pipeline {
        queue,
        comm,
        handler,
        restart,
        reload_rx,
        tasks,
    }
}

async fn stop_pipeline(p: &mut Pipeline) {
    p.comm.stop();
    p.handler.stop();
    p.queue.shutdown();
    for task in p.tasks.drain(..) {
        let _ = tokio::time::timeout(Duration::from_secs(10), task).await;
    }
}

async fn wait_for_terminal(handler: &CommandHandler, id: &str) -> Status {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(entry) = handler.store().get(id).await {
            if entry.result.status != Status::InProgress {
                return entry.result.status;
            }
        }
        assert!(Instant::now() < deadline, "command {id} never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn set_group_command_runs_end_to_end() {
    let manager = MockManager::start().await;
    manager.add_file("g1.yml", "agent:\n  retry_interval: 5s\n");
    manager.add_file("g2.yml", "events:\n  batch_size: 2MB\n");
    manager.push_commands_body(
        r#"{"commands":[{"id":"c1","module":"command_handler","command":"set-group","parameters":{"groups":["g1","g2"]}}]}"#,
    );

    let dir = tempfile::tempdir().unwrap();
    let mut p = start_pipeline(&manager, &dir).await;

    assert_eq!(wait_for_terminal(&p.handler, "c1").await, Status::Success);

    // Group files were fetched into the shared dir.
    let shared = dir.path().join("data").join("shared");
    assert!(std::fs::read_to_string(shared.join("g1.yml"))
        .unwrap()
        .contains("retry_interval"));
    assert!(std::fs::read_to_string(shared.join("g2.yml"))
        .unwrap()
        .contains("batch_size"));

    // The executor asked for a module reload.
    let reload = tokio::time::timeout(Duration::from_secs(5), p.reload_rx.recv())
        .await
        .expect("reload requested");
    assert_eq!(reload, Some(None));

    // The outcome was reported into the stateful buffer.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reports = p
            .queue
            .retrieve_multiple(10, MessageType::Stateful, None)
            .await
            .unwrap();
        if !reports.is_empty() {
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].data["id"], "c1");
            assert_eq!(reports[0].data["result"]["code"], 0);
            break;
        }
        assert!(Instant::now() < deadline, "outcome never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stop_pipeline(&mut p).await;
}

#[tokio::test]
async fn set_group_without_groups_fails_and_is_never_stored() {
    let manager = MockManager::start().await;
    manager.push_commands_body(
        r#"{"commands":[{"id":"c2","command":"set-group","parameters":{}}]}"#,
    );

    let dir = tempfile::tempdir().unwrap();
    let mut p = start_pipeline(&manager, &dir).await;

    // The failure is reported…
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let reports = p
            .queue
            .retrieve_multiple(10, MessageType::Stateful, None)
            .await
            .unwrap();
        if !reports.is_empty() {
            assert_eq!(reports[0].data["id"], "c2");
            assert_eq!(reports[0].data["result"]["code"], 1);
            break;
        }
        assert!(Instant::now() < deadline, "rejection never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // …but the command never reached IN_PROGRESS (not persisted at all).
    assert!(p.handler.store().get("c2").await.is_none());
    // And it left the command buffer.
    assert!(p.queue.is_empty(MessageType::Command).await.unwrap());

    stop_pipeline(&mut p).await;
}

#[tokio::test]
async fn restart_command_raises_the_restart_latch() {
    let manager = MockManager::start().await;
    manager.push_commands_body(r#"{"commands":[{"id":"c3","command":"restart"}]}"#);

    let dir = tempfile::tempdir().unwrap();
    let mut p = start_pipeline(&manager, &dir).await;

    assert_eq!(wait_for_terminal(&p.handler, "c3").await, Status::Success);
    tokio::time::timeout(Duration::from_secs(5), p.restart.wait_requested())
        .await
        .expect("restart latch raised");
    assert!(p.restart.is_requested());

    stop_pipeline(&mut p).await;
}
