//! Durable record of command executions, keyed by id.
//!
//! Storage failures are logged and folded into `bool`/`Option` returns; the
//! dispatch loop decides what to do with a failed write, the store never
//! propagates errors past its boundary.

use std::path::Path;

use serde_json::Value;

use wdn_persistence::{
    ColumnKey, ColumnType, ColumnValue, Criteria, Keys, LogicalOp, OrderDir, Persistence, Row,
    StorageError, NOT_NULL, PRIMARY_KEY,
};

pub const COMMAND_STORE_DB_NAME: &str = "command_store.db";

const TABLE: &str = "command_store";
const COL_ID: &str = "id";
const COL_MODULE: &str = "module";
const COL_COMMAND: &str = "command";
const COL_PARAMETERS: &str = "parameters";
const COL_EXECUTION_MODE: &str = "execution_mode";
const COL_RESULT: &str = "result";
const COL_STATUS: &str = "status";
const COL_TIME: &str = "time";

/// Lifecycle state of a command. Persisted as its discriminant; `Unknown` is
/// an in-memory sentinel meaning "field absent from update" and is never
/// written as a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
    InProgress,
    Timeout,
    Unknown,
}

impl Status {
    pub fn from_i64(value: i64) -> Self {
        match value {
            0 => Status::Success,
            1 => Status::Failure,
            2 => Status::InProgress,
            3 => Status::Timeout,
            _ => Status::Unknown,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Status::Success => 0,
            Status::Failure => 1,
            Status::InProgress => 2,
            Status::Timeout => 3,
            Status::Unknown => 4,
        }
    }
}

/// Persisted as 0 (sync) / 1 (async).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sync,
    Async,
}

impl ExecutionMode {
    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            ExecutionMode::Sync
        } else {
            ExecutionMode::Async
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            ExecutionMode::Sync => 0,
            ExecutionMode::Async => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub status: Status,
    pub message: String,
}

impl CommandResult {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl Default for CommandResult {
    fn default() -> Self {
        Self {
            status: Status::Unknown,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEntry {
    pub id: String,
    pub module: String,
    pub command: String,
    pub parameters: Value,
    pub execution_mode: ExecutionMode,
    pub result: CommandResult,
    /// Fractional seconds since epoch, stamped by [`CommandStore::store`].
    pub time: f64,
}

impl CommandEntry {
    pub fn new(
        id: impl Into<String>,
        module: impl Into<String>,
        command: impl Into<String>,
        parameters: Value,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            id: id.into(),
            module: module.into(),
            command: command.into(),
            parameters,
            execution_mode,
            result: CommandResult::default(),
            time: 0.0,
        }
    }

    /// Parses one command document from the manager's poll response.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "command document is missing an id".to_string())?;
        let command = value
            .get("command")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "command document is missing a command name".to_string())?;
        let module = value
            .get("module")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let parameters = value
            .get("parameters")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let execution_mode = match value.get("execution_mode").and_then(Value::as_str) {
            Some("SYNC") => ExecutionMode::Sync,
            _ => ExecutionMode::Async,
        };

        Ok(Self::new(id, module, command, parameters, execution_mode))
    }
}

pub struct CommandStore {
    db: Persistence,
}

impl CommandStore {
    /// Opens `command_store.db` under `db_dir`, creating the table on first
    /// use. Fails with [`StorageError::Unavailable`] when the file cannot be
    /// opened or the table cannot be created.
    pub async fn open(db_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Persistence::open(db_dir.as_ref().join(COMMAND_STORE_DB_NAME)).await?;

        let exists = db
            .table_exists(TABLE)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !exists {
            db.create_table(TABLE, &table_keys())
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }

        Ok(Self { db })
    }

    /// Inserts the entry, stamping `time` with the current wall clock.
    pub async fn store(&self, entry: &CommandEntry) -> bool {
        let row: Row = vec![
            ColumnValue::new(COL_ID, ColumnType::Text, entry.id.as_str()),
            ColumnValue::new(COL_MODULE, ColumnType::Text, entry.module.as_str()),
            ColumnValue::new(COL_COMMAND, ColumnType::Text, entry.command.as_str()),
            ColumnValue::new(COL_TIME, ColumnType::Real, current_time_secs().to_string()),
            ColumnValue::new(COL_PARAMETERS, ColumnType::Text, entry.parameters.to_string()),
            ColumnValue::new(
                COL_EXECUTION_MODE,
                ColumnType::Integer,
                entry.execution_mode.as_i64().to_string(),
            ),
            ColumnValue::new(COL_RESULT, ColumnType::Text, entry.result.message.as_str()),
            ColumnValue::new(
                COL_STATUS,
                ColumnType::Integer,
                entry.result.status.as_i64().to_string(),
            ),
        ];

        match self.db.insert(TABLE, &row).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, id = %entry.id, "store command failed");
                false
            }
        }
    }

    /// Writes only the entry's non-empty fields; a status of
    /// [`Status::Unknown`] leaves the persisted status untouched.
    pub async fn update(&self, entry: &CommandEntry) -> bool {
        let mut fields: Row = Vec::new();
        if !entry.module.is_empty() {
            fields.push(ColumnValue::new(COL_MODULE, ColumnType::Text, entry.module.as_str()));
        }
        if !entry.command.is_empty() {
            fields.push(ColumnValue::new(
                COL_COMMAND,
                ColumnType::Text,
                entry.command.as_str(),
            ));
        }
        if !entry.parameters.is_null() {
            fields.push(ColumnValue::new(
                COL_PARAMETERS,
                ColumnType::Text,
                entry.parameters.to_string(),
            ));
        }
        if !entry.result.message.is_empty() {
            fields.push(ColumnValue::new(
                COL_RESULT,
                ColumnType::Text,
                entry.result.message.as_str(),
            ));
        }
        if entry.result.status != Status::Unknown {
            fields.push(ColumnValue::new(
                COL_STATUS,
                ColumnType::Integer,
                entry.result.status.as_i64().to_string(),
            ));
        }
        if fields.is_empty() {
            return true;
        }

        let criteria: Criteria = vec![ColumnValue::new(COL_ID, ColumnType::Text, entry.id.as_str())];
        match self.db.update(TABLE, &fields, &criteria, LogicalOp::And).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, id = %entry.id, "update command failed");
                false
            }
        }
    }

    pub async fn delete(&self, id: &str) -> bool {
        let criteria: Criteria = vec![ColumnValue::new(COL_ID, ColumnType::Text, id)];
        match self.db.remove(TABLE, &criteria, LogicalOp::And).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, id, "delete command failed");
                false
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<CommandEntry> {
        let criteria: Criteria = vec![ColumnValue::new(COL_ID, ColumnType::Text, id)];
        match self
            .db
            .select(TABLE, &[], &criteria, LogicalOp::And, &[], OrderDir::Asc, 0)
            .await
        {
            Ok(rows) => rows.first().map(entry_from_row),
            Err(e) => {
                tracing::error!(error = %e, id, "select command failed");
                None
            }
        }
    }

    /// All entries in the given status; `None` when no rows match (an empty
    /// vector is never returned).
    pub async fn get_by_status(&self, status: Status) -> Option<Vec<CommandEntry>> {
        let criteria: Criteria = vec![ColumnValue::new(
            COL_STATUS,
            ColumnType::Integer,
            status.as_i64().to_string(),
        )];
        match self
            .db
            .select(TABLE, &[], &criteria, LogicalOp::And, &[], OrderDir::Asc, 0)
            .await
        {
            Ok(rows) if rows.is_empty() => None,
            Ok(rows) => Some(rows.iter().map(entry_from_row).collect()),
            Err(e) => {
                tracing::error!(error = %e, "select by status failed");
                None
            }
        }
    }

    pub async fn count(&self) -> u64 {
        match self.db.get_count(TABLE, &Vec::new(), LogicalOp::And).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "count commands failed");
                0
            }
        }
    }

    pub async fn clear(&self) -> bool {
        match self.db.remove(TABLE, &Vec::new(), LogicalOp::And).await {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "clear command store failed");
                false
            }
        }
    }
}

fn table_keys() -> Keys {
    vec![
        ColumnKey::new(COL_ID, ColumnType::Text, NOT_NULL | PRIMARY_KEY),
        ColumnKey::new(COL_MODULE, ColumnType::Text, NOT_NULL),
        ColumnKey::new(COL_COMMAND, ColumnType::Text, NOT_NULL),
        ColumnKey::new(COL_PARAMETERS, ColumnType::Text, NOT_NULL),
        ColumnKey::new(COL_EXECUTION_MODE, ColumnType::Integer, NOT_NULL),
        ColumnKey::new(COL_RESULT, ColumnType::Text, NOT_NULL),
        ColumnKey::new(COL_STATUS, ColumnType::Integer, NOT_NULL),
        ColumnKey::new(COL_TIME, ColumnType::Real, NOT_NULL),
    ]
}

fn current_time_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn entry_from_row(row: &Row) -> CommandEntry {
    let mut entry = CommandEntry::new("", "", "", Value::Null, ExecutionMode::Async);
    for cell in row {
        match cell.name.as_str() {
            COL_ID => entry.id = cell.value.clone(),
            COL_MODULE => entry.module = cell.value.clone(),
            COL_COMMAND => entry.command = cell.value.clone(),
            COL_PARAMETERS => {
                entry.parameters = serde_json::from_str(&cell.value).unwrap_or(Value::Null);
            }
            COL_EXECUTION_MODE => {
                entry.execution_mode =
                    ExecutionMode::from_i64(cell.value.parse().unwrap_or_default());
            }
            COL_RESULT => entry.result.message = cell.value.clone(),
            COL_STATUS => {
                entry.result.status = Status::from_i64(cell.value.parse().unwrap_or(4));
            }
            COL_TIME => entry.time = cell.value.parse().unwrap_or_default(),
            _ => {}
        }
    }
    entry
}
