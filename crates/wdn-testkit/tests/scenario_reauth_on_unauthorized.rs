mod harness;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wdn_agent::pipeline;
use wdn_queue::{Message, MessageType};
use wdn_testkit::{wait_until, MockManager};

#[tokio::test]
async fn rejected_event_post_reauthenticates_and_redelivers() {
    let manager = MockManager::start().await;
    // First stateless post bounces with 401; every later one is accepted.
    manager.push_event_status(401);

    let dir = tempfile::tempdir().unwrap();
    let queue = harness::open_queue(&dir.path().join("data")).await;
    let comm = harness::communicator(&manager.url());

    assert!(comm.send_authentication_request().await.unwrap());
    assert_eq!(manager.auth_requests(), 1);

    queue
        .push(
            Message::new(json!({"event": "probe"}), "inv"),
            MessageType::Stateless,
            true,
        )
        .await
        .unwrap();

    let refresh = tokio::spawn({
        let comm = Arc::clone(&comm);
        async move { comm.wait_for_token_expiration_and_authenticate().await }
    });
    let loop_task = tokio::spawn({
        let comm = Arc::clone(&comm);
        let get = pipeline::batch_from_queue(Arc::clone(&queue), MessageType::Stateless);
        let done = pipeline::remove_on_success(Arc::clone(&queue), MessageType::Stateless);
        async move { comm.stateless_message_processing_task(get, done).await }
    });

    // The rejected batch is retried after re-authentication and lands.
    assert!(
        wait_until(Duration::from_secs(10), || {
            !manager.stateless_bodies().is_empty()
        })
        .await,
        "batch never redelivered"
    );

    let deadline = Instant::now() + Duration::from_secs(10);
    while queue.size(MessageType::Stateless).await.unwrap() > 0 {
        assert!(Instant::now() < deadline, "redelivered batch not removed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The 401 triggered exactly one additional authentication.
    assert_eq!(manager.auth_requests(), 2);
    assert!(manager.stateless_bodies()[0].contains("probe"));

    comm.stop();
    queue.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(10), loop_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(10), refresh).await;
}
