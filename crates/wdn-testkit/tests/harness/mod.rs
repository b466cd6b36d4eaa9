#![allow(dead_code)]

//! Shared wiring for the end-to-end scenarios: real components, loopback
//! HTTP against the mock manager.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use wdn_agent::settings::AgentSettings;
use wdn_communicator::{Communicator, CommunicatorOptions};
use wdn_http::{HttpPerformer, ReqwestPerformer, VerificationMode};
use wdn_queue::{MultiTypeQueue, QueueOptions};

pub async fn open_queue(data_dir: &Path) -> Arc<MultiTypeQueue> {
    std::fs::create_dir_all(data_dir).unwrap();
    Arc::new(
        MultiTypeQueue::open(data_dir, QueueOptions::default())
            .await
            .expect("open queue"),
    )
}

pub fn communicator(server_url: &str) -> Arc<Communicator> {
    let http: Arc<dyn HttpPerformer> = Arc::new(ReqwestPerformer::new().expect("http client"));
    Arc::new(Communicator::new(
        http,
        CommunicatorOptions {
            server_url: server_url.to_string(),
            retry_interval: Duration::from_millis(100),
            verification_mode: VerificationMode::Full,
            batch_size: 10_000,
            commands_request_timeout: Duration::from_secs(10),
        },
        "agent-uuid",
        "agent-key",
        || "WardenAgent/0.0.1 (test)".to_string(),
    ))
}

pub fn settings(dir: &Path, server_url: &str) -> AgentSettings {
    AgentSettings {
        server_url: server_url.to_string(),
        retry_interval: Duration::from_millis(100),
        verification_mode: VerificationMode::Full,
        commands_request_timeout: Duration::from_secs(10),
        batch_size: 10_000,
        data_path: dir.join("data"),
        run_path: dir.join("run"),
        uuid: "agent-uuid".to_string(),
        key: "agent-key".to_string(),
        groups: vec!["default".to_string()],
        queue_max_items: 10_000,
        queue_max_bytes: 10 * 1024 * 1024,
        config_hash: String::new(),
    }
}
