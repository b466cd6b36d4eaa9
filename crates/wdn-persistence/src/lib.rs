//! Typed table abstraction over an embedded SQLite database.
//!
//! Each store component owns one [`Persistence`] handle (one database file).
//! The handle keeps a single connection behind an async mutex; every
//! operation holds the lock for the duration of one statement, and
//! transactions execute literal BEGIN/COMMIT/ROLLBACK on that connection so
//! statements issued between `begin_transaction` and `commit` run inside it.
//! Nested transactions are rejected.

pub mod column;

pub use column::{
    ColumnKey, ColumnType, ColumnValue, Criteria, Keys, LogicalOp, OrderDir, Row, AUTO_INCREMENT,
    NONE, NOT_NULL, PRIMARY_KEY,
};

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow};
use sqlx::{Column as _, Connection, Row as _, TypeInfo, ValueRef};
use tokio::sync::Mutex;

/// Identifies an open transaction. Monotonically increasing per handle;
/// commit or rollback consumes the id.
pub type TransactionId = u32;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database file could not be opened or initialized.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A statement failed in the backend.
    #[error("query failed: {0}")]
    Query(String),
    /// Transaction misuse: nesting, or commit/rollback of an unknown id.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Query(e.to_string())
    }
}

struct Inner {
    conn: SqliteConnection,
    active_tx: Option<TransactionId>,
    next_tx: TransactionId,
}

/// One SQLite database file, opened with WAL journaling so concurrent
/// readers and a single writer are safe.
pub struct Persistence {
    inner: Mutex<Inner>,
}

impl Persistence {
    /// Opens (creating if missing) the database file at `db_path`.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let conn = SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                active_tx: None,
                next_tx: 1,
            }),
        })
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let sql = format!(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = {}",
            quote_text(table)
        );
        let mut inner = self.inner.lock().await;
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut inner.conn).await?;
        Ok(count > 0)
    }

    pub async fn create_table(&self, table: &str, keys: &Keys) -> Result<(), StorageError> {
        let pk_names: Vec<&str> = keys
            .iter()
            .filter(|k| k.attributes & PRIMARY_KEY != 0)
            .map(|k| k.name.as_str())
            .collect();

        let mut defs: Vec<String> = Vec::with_capacity(keys.len() + 1);
        for key in keys {
            let mut def = format!("{} {}", key.name, key.column_type.sql_name());
            if key.attributes & PRIMARY_KEY != 0 && pk_names.len() == 1 {
                def.push_str(" PRIMARY KEY");
                if key.attributes & AUTO_INCREMENT != 0 {
                    def.push_str(" AUTOINCREMENT");
                }
            }
            if key.attributes & NOT_NULL != 0 {
                def.push_str(" NOT NULL");
            }
            defs.push(def);
        }
        if pk_names.len() > 1 {
            defs.push(format!("PRIMARY KEY ({})", pk_names.join(", ")));
        }

        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", table, defs.join(", "));
        self.execute(&sql).await.map(|_| ())
    }

    pub async fn drop_table(&self, table: &str) -> Result<(), StorageError> {
        let sql = format!("DROP TABLE IF EXISTS {table}");
        self.execute(&sql).await.map(|_| ())
    }

    pub async fn insert(&self, table: &str, row: &Row) -> Result<(), StorageError> {
        if row.is_empty() {
            return Err(StorageError::Query("insert with no values".into()));
        }
        let names: Vec<&str> = row.iter().map(|c| c.name.as_str()).collect();
        let values: Vec<String> = row.iter().map(ColumnValue::render).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            names.join(", "),
            values.join(", ")
        );
        self.execute(&sql).await.map(|_| ())
    }

    /// Updates rows matched by `criteria` (all rows when empty). Returns the
    /// number of rows changed.
    pub async fn update(
        &self,
        table: &str,
        fields: &Row,
        criteria: &Criteria,
        logical_op: LogicalOp,
    ) -> Result<u64, StorageError> {
        if fields.is_empty() {
            return Err(StorageError::Query("update with no fields".into()));
        }
        let assignments: Vec<String> = fields
            .iter()
            .map(|c| format!("{} = {}", c.name, c.render()))
            .collect();
        let sql = format!(
            "UPDATE {} SET {}{}",
            table,
            assignments.join(", "),
            where_clause(criteria, logical_op)
        );
        self.execute(&sql).await
    }

    /// Deletes rows matched by `criteria` (all rows when empty). Returns the
    /// number of rows deleted.
    pub async fn remove(
        &self,
        table: &str,
        criteria: &Criteria,
        logical_op: LogicalOp,
    ) -> Result<u64, StorageError> {
        let sql = format!("DELETE FROM {}{}", table, where_clause(criteria, logical_op));
        self.execute(&sql).await
    }

    /// Selects rows. An empty `projection` means every column; `limit` 0
    /// means no limit.
    #[allow(clippy::too_many_arguments)]
    pub async fn select(
        &self,
        table: &str,
        projection: &[&str],
        criteria: &Criteria,
        logical_op: LogicalOp,
        order_by: &[&str],
        order_dir: OrderDir,
        limit: u32,
    ) -> Result<Vec<Row>, StorageError> {
        let cols = if projection.is_empty() {
            "*".to_string()
        } else {
            projection.join(", ")
        };
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            cols,
            table,
            where_clause(criteria, logical_op)
        );
        if !order_by.is_empty() {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                order_by.join(", "),
                order_dir.sql_name()
            ));
        }
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut inner = self.inner.lock().await;
        let rows = sqlx::query(&sql).fetch_all(&mut inner.conn).await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn get_count(
        &self,
        table: &str,
        criteria: &Criteria,
        logical_op: LogicalOp,
    ) -> Result<u64, StorageError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            table,
            where_clause(criteria, logical_op)
        );
        let mut inner = self.inner.lock().await;
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut inner.conn).await?;
        Ok(count.max(0) as u64)
    }

    /// Sum of byte lengths of the listed fields over the matched rows.
    pub async fn get_size(
        &self,
        table: &str,
        fields: &[&str],
        criteria: &Criteria,
        logical_op: LogicalOp,
    ) -> Result<u64, StorageError> {
        if fields.is_empty() {
            return Err(StorageError::Query("get_size with no fields".into()));
        }
        let lengths: Vec<String> = fields.iter().map(|f| format!("LENGTH({f})")).collect();
        let sql = format!(
            "SELECT SUM({}) FROM {}{}",
            lengths.join(" + "),
            table,
            where_clause(criteria, logical_op)
        );
        let mut inner = self.inner.lock().await;
        let total: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&mut inner.conn).await?;
        Ok(total.unwrap_or(0).max(0) as u64)
    }

    pub async fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.active_tx.is_some() {
            return Err(StorageError::Transaction(
                "nested transactions are not supported".into(),
            ));
        }
        sqlx::query("BEGIN").execute(&mut inner.conn).await?;
        let id = inner.next_tx;
        inner.next_tx = inner.next_tx.wrapping_add(1);
        inner.active_tx = Some(id);
        Ok(id)
    }

    pub async fn commit(&self, id: TransactionId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.active_tx != Some(id) {
            return Err(StorageError::Transaction(format!(
                "commit of unknown transaction {id}"
            )));
        }
        sqlx::query("COMMIT").execute(&mut inner.conn).await?;
        inner.active_tx = None;
        Ok(())
    }

    pub async fn rollback(&self, id: TransactionId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.active_tx != Some(id) {
            return Err(StorageError::Transaction(format!(
                "rollback of unknown transaction {id}"
            )));
        }
        sqlx::query("ROLLBACK").execute(&mut inner.conn).await?;
        inner.active_tx = None;
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().await;
        let done = sqlx::query(sql).execute(&mut inner.conn).await?;
        Ok(done.rows_affected())
    }
}

fn quote_text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn where_clause(criteria: &Criteria, logical_op: LogicalOp) -> String {
    if criteria.is_empty() {
        return String::new();
    }
    let conditions: Vec<String> = criteria
        .iter()
        .map(|c| format!("{} = {}", c.name, c.render()))
        .collect();
    format!(
        " WHERE {}",
        conditions.join(&format!(" {} ", logical_op.sql_name()))
    )
}

/// Decodes one result row into typed cells. SQLite is dynamically typed, so
/// the tag comes from the stored value's storage class; NULL decodes as an
/// empty TEXT value.
fn decode_row(row: &SqliteRow) -> Result<Row, StorageError> {
    let mut out = Vec::with_capacity(row.len());
    for (idx, col) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let cell = if raw.is_null() {
            ColumnValue::new(col.name(), ColumnType::Text, "")
        } else {
            match raw.type_info().name() {
                "INTEGER" => ColumnValue::new(
                    col.name(),
                    ColumnType::Integer,
                    row.try_get::<i64, _>(idx)?.to_string(),
                ),
                "REAL" => ColumnValue::new(
                    col.name(),
                    ColumnType::Real,
                    row.try_get::<f64, _>(idx)?.to_string(),
                ),
                _ => ColumnValue::new(col.name(), ColumnType::Text, row.try_get::<String, _>(idx)?),
            }
        };
        out.push(cell);
    }
    Ok(out)
}
