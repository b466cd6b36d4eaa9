mod scripted;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use scripted::{auth_body, make_jwt, ok, status, ScriptedPerformer, AUTH, COMMANDS, STATELESS};
use wdn_communicator::{Communicator, CommunicatorOptions, GetMessages, OnSuccess};
use wdn_http::HttpPerformer;

fn communicator(http: Arc<ScriptedPerformer>, commands_timeout: Duration) -> Arc<Communicator> {
    let performer: Arc<dyn HttpPerformer> = http;
    Arc::new(Communicator::new(
        performer,
        CommunicatorOptions {
            server_url: "https://manager:27000".to_string(),
            retry_interval: Duration::from_millis(50),
            commands_request_timeout: commands_timeout,
            ..CommunicatorOptions::default()
        },
        "agent-uuid",
        "agent-key",
        || "WardenAgent/0.0.1 (test)".to_string(),
    ))
}

fn recording_on_success() -> (OnSuccess, Arc<Mutex<Vec<(usize, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let on_success: OnSuccess = Box::new(move |count, body| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().unwrap().push((count, body));
        })
    });
    (on_success, seen)
}

#[tokio::test(start_paused = true)]
async fn token_is_refreshed_two_seconds_before_expiry() {
    let now = chrono::Utc::now().timestamp();
    let http = Arc::new(ScriptedPerformer::new());
    http.push(AUTH, ok(&auth_body(&make_jwt(now + 10))));
    http.push(AUTH, ok(&auth_body(&make_jwt(now + 3600))));

    let comm = communicator(Arc::clone(&http), Duration::from_secs(20));
    assert!(comm.send_authentication_request().await.unwrap());

    let started = tokio::time::Instant::now();
    let refresh = tokio::spawn({
        let comm = Arc::clone(&comm);
        async move { comm.wait_for_token_expiration_and_authenticate().await }
    });

    // Virtual time advances while everything is parked on timers.
    while http.requests_to(AUTH).len() < 2 {
        assert!(
            started.elapsed() < Duration::from_secs(30),
            "refresh never happened"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(8), "refreshed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "refreshed after expiry: {elapsed:?}");

    comm.stop();
    assert!(refresh.await.unwrap().is_ok());
}

#[tokio::test]
async fn concurrent_reauth_requests_collapse_into_one() {
    let now = chrono::Utc::now().timestamp();
    let http = Arc::new(ScriptedPerformer::new());
    http.push(AUTH, ok(&auth_body(&make_jwt(now + 3600))));
    http.push(AUTH, ok(&auth_body(&make_jwt(now + 3600))));

    let comm = communicator(Arc::clone(&http), Duration::from_secs(20));
    assert!(comm.send_authentication_request().await.unwrap());

    let refresh = tokio::spawn({
        let comm = Arc::clone(&comm);
        async move { comm.wait_for_token_expiration_and_authenticate().await }
    });
    // Let the refresh task park on its (distant) expiry timer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A stampede of 401 handlers all trying to re-authenticate at once.
    for _ in 0..8 {
        comm.try_reauthenticate();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while http.requests_to(AUTH).len() < 2 {
        assert!(std::time::Instant::now() < deadline, "re-auth never fired");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Settle: no further authentication requests appear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(http.requests_to(AUTH).len(), 2);

    comm.stop();
    assert!(refresh.await.unwrap().is_ok());
}

#[tokio::test]
async fn unauthorized_event_post_reauthenticates_and_retries_with_new_token() {
    let now = chrono::Utc::now().timestamp();
    let t1 = make_jwt(now + 3600);
    let t2 = make_jwt(now + 7200);

    let http = Arc::new(ScriptedPerformer::new());
    http.push(AUTH, ok(&auth_body(&t1)));
    http.push(AUTH, ok(&auth_body(&t2)));
    http.push(STATELESS, status(401, ""));
    http.push(STATELESS, ok(""));

    let comm = communicator(Arc::clone(&http), Duration::from_secs(20));
    assert!(comm.send_authentication_request().await.unwrap());

    let refresh = tokio::spawn({
        let comm = Arc::clone(&comm);
        async move { comm.wait_for_token_expiration_and_authenticate().await }
    });

    let (on_success, seen) = recording_on_success();
    let get_messages: GetMessages =
        Box::new(|_max_bytes| Box::pin(async { (2usize, r#"[{"a":1},{"b":2}]"#.to_string()) }));

    let loop_task = tokio::spawn({
        let comm = Arc::clone(&comm);
        async move {
            comm.stateless_message_processing_task(get_messages, on_success)
                .await
        }
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while http.requests_to(STATELESS).len() < 2 {
        assert!(std::time::Instant::now() < deadline, "retry never happened");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let posts = http.requests_to(STATELESS);
    assert_eq!(posts[0].token, t1);
    assert_eq!(posts[1].token, t2, "second attempt must carry the refreshed token");

    // The failed first attempt produced no success callback; the second did.
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, 2);

    comm.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), loop_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), refresh).await;
}

#[tokio::test]
async fn commands_loop_passes_bodies_verbatim_with_configured_timeout() {
    let now = chrono::Utc::now().timestamp();
    let http = Arc::new(ScriptedPerformer::new());
    http.push(AUTH, ok(&auth_body(&make_jwt(now + 3600))));
    http.push(COMMANDS, ok(r#"{"commands":[{"id":"c1","command":"restart"}]}"#));

    let comm = communicator(Arc::clone(&http), Duration::from_secs(20));
    assert!(comm.send_authentication_request().await.unwrap());

    let (on_success, seen) = recording_on_success();
    let loop_task = tokio::spawn({
        let comm = Arc::clone(&comm);
        async move { comm.get_commands_from_manager(on_success).await }
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while seen.lock().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline, "no command body delivered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let first = seen.lock().unwrap()[0].clone();
    assert_eq!(first.0, 0, "the poll loop batches nothing");
    assert!(first.1.contains("c1"));

    let polls = http.requests_to(COMMANDS);
    assert_eq!(polls[0].request_timeout, Duration::from_secs(20));
    assert!(!polls[0].token.is_empty());

    comm.stop();
    let _ = tokio::time::timeout(Duration::from_secs(5), loop_task).await;
}

#[tokio::test]
async fn group_configuration_is_downloaded_to_destination() {
    let now = chrono::Utc::now().timestamp();
    let http = Arc::new(ScriptedPerformer::new());
    http.push(AUTH, ok(&auth_body(&make_jwt(now + 3600))));
    http.push(
        "/api/v1/files?file_name=default.yml",
        ok("agent:\n  retry_interval: 10s\n"),
    );

    let comm = communicator(Arc::clone(&http), Duration::from_secs(20));
    assert!(comm.send_authentication_request().await.unwrap());

    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("default.yml");
    assert!(comm.get_group_config("default", &dst).await);

    let written = std::fs::read_to_string(&dst).unwrap();
    assert!(written.contains("retry_interval"));
}

#[tokio::test]
async fn group_configuration_download_requires_a_token() {
    let http = Arc::new(ScriptedPerformer::new());
    let comm = communicator(Arc::clone(&http), Duration::from_secs(20));

    let dir = tempfile::tempdir().unwrap();
    assert!(!comm.get_group_config("default", dir.path().join("x.yml")).await);
    assert!(http.requests().is_empty(), "no request without a token");
}
