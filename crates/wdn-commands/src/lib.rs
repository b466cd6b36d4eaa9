//! Durable command lifecycle: a SQLite-backed store of every command the
//! manager has issued, plus the dispatch loop that executes them with
//! at-most-once completion semantics.

pub mod handler;
pub mod store;

pub use handler::{validate_command, CommandHandler, VALID_COMMANDS};
pub use store::{
    CommandEntry, CommandResult, CommandStore, ExecutionMode, Status, COMMAND_STORE_DB_NAME,
};
