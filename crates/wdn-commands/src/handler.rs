//! Command dispatch loop.
//!
//! One suspendable task drains commands from a supplier, validates them,
//! persists them IN_PROGRESS, executes them through a caller-supplied
//! dispatcher, and reports the terminal result. A queue item is popped only
//! after the store owns it (or after validation rejects it), so a crash
//! between poll iterations never loses a command, and startup recovery
//! resolves any execution the previous process left IN_PROGRESS.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::store::{CommandEntry, CommandResult, CommandStore, Status};

/// Commands the agent knows how to execute.
pub const VALID_COMMANDS: [&str; 3] = ["set-group", "fetch-config", "restart"];

const EMPTY_QUEUE_POLL: Duration = Duration::from_millis(100);

/// Checks the command name and its parameters. `set-group` needs a
/// `groups` parameter holding a non-empty array of non-empty strings;
/// `fetch-config` and `restart` take none (extra fields are tolerated, a
/// stray `groups` is ignored).
pub fn validate_command(entry: &CommandEntry) -> Result<(), String> {
    match entry.command.as_str() {
        "set-group" => {
            let groups_valid = entry
                .parameters
                .get("groups")
                .and_then(Value::as_array)
                .map(|groups| {
                    !groups.is_empty()
                        && groups
                            .iter()
                            .all(|g| g.as_str().is_some_and(|s| !s.is_empty()))
                })
                .unwrap_or(false);
            if groups_valid {
                Ok(())
            } else {
                Err("Error: Missing or empty group list".to_string())
            }
        }
        "fetch-config" | "restart" => Ok(()),
        other => Err(format!("Error: Command not recognized: {other}")),
    }
}

pub struct CommandHandler {
    store: CommandStore,
    keep_running: AtomicBool,
}

impl CommandHandler {
    pub fn new(store: CommandStore) -> Self {
        Self {
            store,
            keep_running: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }

    pub fn store(&self) -> &CommandStore {
        &self.store
    }

    /// Runs recovery, then the dispatch loop until [`stop`](Self::stop).
    ///
    /// `get_from_queue` peeks the next command without consuming it;
    /// `pop_from_queue` consumes it; `report_result` feeds the outcome back
    /// to the event pipeline; `dispatch` performs the actual execution. One
    /// command is in flight at a time.
    pub async fn process_commands<G, GF, P, PF, R, RF, D, DF>(
        &self,
        get_from_queue: G,
        pop_from_queue: P,
        report_result: R,
        dispatch: D,
    ) where
        G: Fn() -> GF,
        GF: Future<Output = Option<CommandEntry>>,
        P: Fn() -> PF,
        PF: Future<Output = ()>,
        R: Fn(CommandEntry) -> RF,
        RF: Future<Output = ()>,
        D: Fn(CommandEntry) -> DF,
        DF: Future<Output = CommandResult>,
    {
        self.clean_up_in_progress(&report_result).await;

        while self.keep_running.load(Ordering::SeqCst) {
            let Some(mut entry) = get_from_queue().await else {
                tokio::time::sleep(EMPTY_QUEUE_POLL).await;
                continue;
            };

            if let Err(reason) = validate_command(&entry) {
                tracing::warn!(id = %entry.id, command = %entry.command, %reason, "rejecting command");
                entry.result = CommandResult::new(Status::Failure, reason);
                report_result(entry).await;
                pop_from_queue().await;
                continue;
            }

            entry.result = CommandResult::new(Status::InProgress, String::new());
            if !self.store.store(&entry).await {
                entry.result =
                    CommandResult::new(Status::Failure, "Agent's database failure".to_string());
                report_result(entry).await;
                pop_from_queue().await;
                continue;
            }

            // The store owns the command now; consuming the queue item is safe.
            pop_from_queue().await;

            tracing::debug!(id = %entry.id, command = %entry.command, "dispatching command");
            entry.result = dispatch(entry.clone()).await;

            if !self.store.update(&entry).await {
                tracing::error!(id = %entry.id, "failed to persist command result");
            }
            report_result(entry).await;
        }
    }

    /// Resolves commands the previous process left IN_PROGRESS: a crash
    /// mid-dispatch leaves orphaned rows whose real outcome is unknowable,
    /// so they are closed as failures and reported exactly once.
    async fn clean_up_in_progress<R, RF>(&self, report_result: &R)
    where
        R: Fn(CommandEntry) -> RF,
        RF: Future<Output = ()>,
    {
        let Some(orphans) = self.store.get_by_status(Status::InProgress).await else {
            return;
        };
        for mut entry in orphans {
            tracing::warn!(id = %entry.id, "closing command interrupted by restart");
            entry.result = CommandResult::new(
                Status::Failure,
                "Agent stopped during execution".to_string(),
            );
            if !self.store.update(&entry).await {
                tracing::error!(id = %entry.id, "failed to persist recovery result");
            }
            report_result(entry).await;
        }
    }
}
