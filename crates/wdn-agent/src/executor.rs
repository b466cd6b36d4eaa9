//! Execution of manager-issued commands.
//!
//! The dispatch loop in `wdn-commands` validates and persists; this module
//! is the executor it hands validated entries to. `set-group` and
//! `fetch-config` pull group configuration through the communicator,
//! `restart` asks the supervisor for an in-process restart.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Notify, RwLock};

use wdn_commands::{CommandEntry, CommandResult, Status};
use wdn_communicator::Communicator;

use crate::settings::AgentSettings;

/// Carries reload requests (whole-agent or single module) to the supervisor.
pub type ReloadSender = mpsc::UnboundedSender<Option<String>>;

const GROUPS_FILE_NAME: &str = "groups.json";

/// Supervisor-side restart latch: `restart` commands request, the run loop
/// observes.
pub struct RestartHandle {
    requested: AtomicBool,
    notify: Notify,
}

impl Default for RestartHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RestartHandle {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub async fn wait_requested(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

pub struct CommandExecutor {
    communicator: Arc<Communicator>,
    shared_dir: PathBuf,
    groups_file: PathBuf,
    groups: RwLock<Vec<String>>,
    reload_tx: ReloadSender,
    restart: Arc<RestartHandle>,
}

impl CommandExecutor {
    pub fn new(
        communicator: Arc<Communicator>,
        settings: &AgentSettings,
        reload_tx: ReloadSender,
        restart: Arc<RestartHandle>,
    ) -> Self {
        let groups_file = settings.data_path.join(GROUPS_FILE_NAME);
        let groups = load_groups(&groups_file).unwrap_or_else(|| settings.groups.clone());
        Self {
            communicator,
            shared_dir: settings.shared_dir(),
            groups_file,
            groups: RwLock::new(groups),
            reload_tx,
            restart,
        }
    }

    pub async fn groups(&self) -> Vec<String> {
        self.groups.read().await.clone()
    }

    pub async fn dispatch(&self, entry: CommandEntry) -> CommandResult {
        match entry.command.as_str() {
            "set-group" => self.set_group(&entry).await,
            "fetch-config" => self.fetch_config().await,
            "restart" => {
                self.restart.request();
                CommandResult::new(Status::Success, "Agent restart scheduled".to_string())
            }
            other => CommandResult::new(
                Status::Failure,
                format!("Error: Command not recognized: {other}"),
            ),
        }
    }

    async fn set_group(&self, entry: &CommandEntry) -> CommandResult {
        let groups: Vec<String> = entry
            .parameters
            .get("groups")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if groups.is_empty() {
            return CommandResult::new(Status::Failure, "Error: Missing or empty group list".to_string());
        }

        if let Err(e) = persist_groups(&self.groups_file, &groups).await {
            tracing::error!(error = %e, "failed to persist group membership");
            return CommandResult::new(Status::Failure, "Failed to persist group membership".to_string());
        }
        *self.groups.write().await = groups.clone();

        if !self.download_groups(&groups).await {
            return CommandResult::new(
                Status::Failure,
                "Failed to download group configuration".to_string(),
            );
        }

        let _ = self.reload_tx.send(None);
        CommandResult::new(Status::Success, "Group configuration updated".to_string())
    }

    async fn fetch_config(&self) -> CommandResult {
        let groups = self.groups().await;
        if !self.download_groups(&groups).await {
            return CommandResult::new(
                Status::Failure,
                "Failed to download group configuration".to_string(),
            );
        }
        let _ = self.reload_tx.send(None);
        CommandResult::new(Status::Success, "Configuration fetched".to_string())
    }

    async fn download_groups(&self, groups: &[String]) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&self.shared_dir).await {
            tracing::error!(error = %e, dir = %self.shared_dir.display(), "cannot create shared config dir");
            return false;
        }
        for group in groups {
            let dst = self.shared_dir.join(format!(
                "{group}{}",
                wdn_communicator::SHARED_FILE_EXTENSION
            ));
            if !self.communicator.get_group_config(group, &dst).await {
                tracing::warn!(group = %group, "group configuration download failed");
                return false;
            }
        }
        true
    }
}

fn load_groups(path: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

async fn persist_groups(path: &Path, groups: &[String]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string(groups).expect("group list serialization must not fail");
    tokio::fs::write(path, raw).await
}
