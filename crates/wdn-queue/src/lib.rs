//! Persistent multi-queue: three named FIFO buffers (stateful, stateless,
//! command) backed by one SQLite file.
//!
//! Each buffer has independent row and byte quotas. Producers `push`
//! (optionally blocking until capacity frees up), consumers retrieve FIFO
//! prefixes by count or by byte budget and then `remove_multiple` once the
//! batch has been acknowledged. A per-buffer async mutex serializes the
//! capacity decision with the insert, so a single process has no
//! check-then-insert race among writers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

use wdn_persistence::{
    ColumnKey, ColumnType, ColumnValue, Criteria, Keys, LogicalOp, OrderDir, Persistence, Row,
    StorageError, NONE, NOT_NULL,
};

pub const QUEUE_DB_NAME: &str = "multitype_queue.db";

pub const DEFAULT_MAX_ITEMS: u64 = 10_000;
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(5);

const STORED_FIELDS: [&str; 4] = ["module_name", "module_type", "metadata", "data"];

/// The three named buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Stateful,
    Stateless,
    Command,
}

impl MessageType {
    pub const ALL: [MessageType; 3] = [
        MessageType::Stateful,
        MessageType::Stateless,
        MessageType::Command,
    ];

    fn table(self) -> &'static str {
        match self {
            MessageType::Stateful => "stateful",
            MessageType::Stateless => "stateless",
            MessageType::Command => "commands",
        }
    }

    fn index(self) -> usize {
        match self {
            MessageType::Stateful => 0,
            MessageType::Stateless => 1,
            MessageType::Command => 2,
        }
    }
}

/// One queued event. `data` is opaque to the queue; only its serialized
/// length participates in byte accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub module_name: String,
    pub module_type: String,
    pub metadata: String,
    pub data: serde_json::Value,
}

impl Message {
    pub fn new(data: serde_json::Value, module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            module_type: String::new(),
            metadata: String::new(),
            data,
        }
    }

    pub fn with_module_type(mut self, module_type: impl Into<String>) -> Self {
        self.module_type = module_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Bytes this message occupies for quota purposes.
    pub fn stored_size(&self) -> u64 {
        (self.module_name.len()
            + self.module_type.len()
            + self.metadata.len()
            + self.data.to_string().len()) as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub max_items: u64,
    pub max_bytes: u64,
    /// How long a consumer waits for content when batching.
    pub batch_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_bytes: DEFAULT_MAX_BYTES,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

struct QueueState {
    /// Serializes capacity check + insert, and destructive batch operations.
    gate: Mutex<()>,
    /// Signaled when rows are removed (capacity freed) or on shutdown.
    space_freed: Notify,
    /// Signaled when rows arrive.
    arrived: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            space_freed: Notify::new(),
            arrived: Notify::new(),
        }
    }
}

pub struct MultiTypeQueue {
    db: Persistence,
    options: QueueOptions,
    states: [QueueState; 3],
    /// Transactions are per-handle and must not nest; buffers share the
    /// handle, so transactional sections serialize here.
    tx_gate: Mutex<()>,
    stopping: AtomicBool,
}

impl MultiTypeQueue {
    /// Opens (or creates) the queue database under `data_dir`.
    pub async fn open(data_dir: impl AsRef<Path>, options: QueueOptions) -> Result<Self, StorageError> {
        let db = Persistence::open(data_dir.as_ref().join(QUEUE_DB_NAME)).await?;

        for kind in MessageType::ALL {
            if !db.table_exists(kind.table()).await? {
                db.create_table(kind.table(), &table_keys())
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            }
        }

        Ok(Self {
            db,
            options,
            states: [QueueState::new(), QueueState::new(), QueueState::new()],
            tx_gate: Mutex::new(()),
            stopping: AtomicBool::new(false),
        })
    }

    /// Inserts one message. With `block` the call waits until the quota
    /// admits the message (or the queue shuts down); without it a full queue
    /// returns 0 immediately. Returns the number of rows inserted.
    pub async fn push(
        &self,
        message: Message,
        kind: MessageType,
        block: bool,
    ) -> Result<usize, StorageError> {
        if message.data.is_null() {
            tracing::warn!(module = %message.module_name, "discarding message with empty payload");
            return Ok(0);
        }
        let size = message.stored_size();

        loop {
            let state = self.state(kind);
            let notified = state.space_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let _gate = state.gate.lock().await;
                if self.has_capacity(kind, size, 1).await? {
                    self.insert_rows(kind, std::slice::from_ref(&message)).await?;
                    state.arrived.notify_waiters();
                    return Ok(1);
                }
            }

            // Only a push that would have to wait observes shutdown; one
            // that fits still lands, so in-flight work can report during
            // the rundown window.
            if !block || self.stopping.load(Ordering::SeqCst) {
                return Ok(0);
            }
            notified.as_mut().await;
        }
    }

    /// Atomic batch insert: either every message lands or none does. A batch
    /// that would breach either quota (or contains an empty payload) is
    /// rejected whole with 0 inserted.
    pub async fn push_batch(
        &self,
        messages: &[Message],
        kind: MessageType,
    ) -> Result<usize, StorageError> {
        if messages.is_empty() {
            return Ok(0);
        }
        if messages.iter().any(|m| m.data.is_null()) {
            tracing::warn!(count = messages.len(), "batch rejected: empty payload present");
            return Ok(0);
        }
        let total: u64 = messages.iter().map(Message::stored_size).sum();

        let state = self.state(kind);
        let _gate = state.gate.lock().await;
        if !self.has_capacity(kind, total, messages.len() as u64).await? {
            tracing::warn!(count = messages.len(), "batch rejected: queue quota would be breached");
            return Ok(0);
        }

        self.insert_rows(kind, messages).await?;
        state.arrived.notify_waiters();
        Ok(messages.len())
    }

    /// Up to `n` earliest rows, in insertion order, optionally filtered by
    /// module name. Rows are left in place.
    pub async fn retrieve_multiple(
        &self,
        n: usize,
        kind: MessageType,
        module: Option<&str>,
    ) -> Result<Vec<Message>, StorageError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .db
            .select(
                kind.table(),
                &STORED_FIELDS,
                &module_criteria(module),
                LogicalOp::And,
                &["rowid"],
                OrderDir::Asc,
                n as u32,
            )
            .await?;
        Ok(rows.iter().filter_map(row_to_message).collect())
    }

    /// Earliest rows whose accumulated byte length first reaches or exceeds
    /// `max_bytes`; the boundary row is included, so the total may exceed the
    /// budget by at most one row.
    pub async fn retrieve_by_size(
        &self,
        max_bytes: u64,
        kind: MessageType,
        module: Option<&str>,
    ) -> Result<Vec<Message>, StorageError> {
        let rows = self
            .db
            .select(
                kind.table(),
                &STORED_FIELDS,
                &module_criteria(module),
                LogicalOp::And,
                &["rowid"],
                OrderDir::Asc,
                0,
            )
            .await?;

        let mut out = Vec::new();
        let mut accumulated = 0u64;
        for row in &rows {
            let Some(message) = row_to_message(row) else {
                continue;
            };
            accumulated += message.stored_size();
            out.push(message);
            if accumulated >= max_bytes {
                break;
            }
        }
        Ok(out)
    }

    /// Deletes the earliest `n` rows (honoring the module filter) in one
    /// transaction and wakes blocked pushers. Returns the number deleted.
    pub async fn remove_multiple(
        &self,
        n: usize,
        kind: MessageType,
        module: Option<&str>,
    ) -> Result<usize, StorageError> {
        if n == 0 {
            return Ok(0);
        }
        let state = self.state(kind);
        let _gate = state.gate.lock().await;

        let rows = self
            .db
            .select(
                kind.table(),
                &["rowid"],
                &module_criteria(module),
                LogicalOp::And,
                &["rowid"],
                OrderDir::Asc,
                n as u32,
            )
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let rowids: Criteria = rows
            .iter()
            .filter_map(|r| r.first())
            .map(|c| ColumnValue::new("rowid", ColumnType::Integer, c.value.clone()))
            .collect();

        let _tx_gate = self.tx_gate.lock().await;
        let tx = self.db.begin_transaction().await?;
        let removed = match self.db.remove(kind.table(), &rowids, LogicalOp::Or).await {
            Ok(k) => k,
            Err(e) => {
                let _ = self.db.rollback(tx).await;
                return Err(e);
            }
        };
        self.db.commit(tx).await?;

        state.space_freed.notify_waiters();
        Ok(removed as usize)
    }

    /// Waits until the buffer has content, up to `timeout`. Returns whether
    /// messages are available.
    pub async fn wait_for_messages(
        &self,
        kind: MessageType,
        timeout: Duration,
    ) -> Result<bool, StorageError> {
        let state = self.state(kind);
        let notified = state.arrived.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.is_empty(kind).await? {
            return Ok(true);
        }

        tokio::select! {
            _ = notified.as_mut() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
        Ok(!self.is_empty(kind).await?)
    }

    pub async fn is_empty(&self, kind: MessageType) -> Result<bool, StorageError> {
        Ok(self.size(kind).await? == 0)
    }

    /// Configured consumer wait used when batching from an empty buffer.
    pub fn batch_timeout(&self) -> Duration {
        self.options.batch_timeout
    }

    /// Number of rows currently buffered.
    pub async fn size(&self, kind: MessageType) -> Result<u64, StorageError> {
        self.db.get_count(kind.table(), &Vec::new(), LogicalOp::And).await
    }

    /// Bytes currently buffered (sum over the stored fields).
    pub async fn stored_size(&self, kind: MessageType) -> Result<u64, StorageError> {
        self.db
            .get_size(kind.table(), &STORED_FIELDS, &Vec::new(), LogicalOp::And)
            .await
    }

    /// Empties the given buffers and wakes blocked pushers.
    pub async fn clear(&self, kinds: &[MessageType]) -> Result<(), StorageError> {
        for kind in kinds {
            let state = self.state(*kind);
            let _gate = state.gate.lock().await;
            let _tx_gate = self.tx_gate.lock().await;
            self.db.remove(kind.table(), &Vec::new(), LogicalOp::And).await?;
            state.space_freed.notify_waiters();
        }
        Ok(())
    }

    /// Releases every blocked producer and consumer. A push that would have
    /// to wait afterwards returns 0; a push that fits still lands.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for state in &self.states {
            state.space_freed.notify_waiters();
            state.arrived.notify_waiters();
        }
    }

    fn state(&self, kind: MessageType) -> &QueueState {
        &self.states[kind.index()]
    }

    async fn has_capacity(
        &self,
        kind: MessageType,
        bytes: u64,
        rows: u64,
    ) -> Result<bool, StorageError> {
        let current_rows = self.size(kind).await?;
        let current_bytes = self.stored_size(kind).await?;
        Ok(current_rows + rows <= self.options.max_items
            && current_bytes + bytes <= self.options.max_bytes)
    }

    async fn insert_rows(&self, kind: MessageType, messages: &[Message]) -> Result<(), StorageError> {
        let _tx_gate = self.tx_gate.lock().await;
        let tx = self.db.begin_transaction().await?;
        for message in messages {
            if let Err(e) = self.db.insert(kind.table(), &message_row(message)).await {
                let _ = self.db.rollback(tx).await;
                return Err(e);
            }
        }
        self.db.commit(tx).await
    }
}

fn table_keys() -> Keys {
    vec![
        ColumnKey::new("module_name", ColumnType::Text, NONE),
        ColumnKey::new("module_type", ColumnType::Text, NONE),
        ColumnKey::new("metadata", ColumnType::Text, NONE),
        ColumnKey::new("data", ColumnType::Text, NOT_NULL),
    ]
}

fn message_row(message: &Message) -> Row {
    vec![
        ColumnValue::new("module_name", ColumnType::Text, message.module_name.as_str()),
        ColumnValue::new("module_type", ColumnType::Text, message.module_type.as_str()),
        ColumnValue::new("metadata", ColumnType::Text, message.metadata.as_str()),
        ColumnValue::new("data", ColumnType::Text, message.data.to_string()),
    ]
}

fn module_criteria(module: Option<&str>) -> Criteria {
    match module {
        Some(name) => vec![ColumnValue::new("module_name", ColumnType::Text, name)],
        None => Vec::new(),
    }
}

fn row_to_message(row: &Row) -> Option<Message> {
    let field = |name: &str| {
        row.iter()
            .find(|c| c.name == name)
            .map(|c| c.value.clone())
            .unwrap_or_default()
    };
    let data_text = field("data");
    let data = match serde_json::from_str(&data_text) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(error = %e, "skipping row with unparseable payload");
            return None;
        }
    };
    Some(Message {
        module_name: field("module_name"),
        module_type: field("module_type"),
        metadata: field("metadata"),
        data,
    })
}
