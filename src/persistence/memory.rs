//! In-memory backend with transaction semantics.
//!
//! Inserts are staged per transaction and only become visible on commit.
//! Rows colliding on an `INSERT IGNORE` key are dropped the way MySQL does.
//! A table can be made to fail on insert so tests can exercise rollback.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{AppResult, MonitorError};
use crate::persistence::backend::{BatchTransaction, PersistenceBackend};
use crate::persistence::record::Row;
use crate::persistence::schema::{ConflictPolicy, InsertStatement};

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    columns: HashSet<(String, String)>,
    ddl: Vec<String>,
    failing_tables: HashSet<String>,
    fail_ddl: u32,
    commits: u32,
    rollbacks: u32,
    closed: bool,
}

/// Shared in-memory database. Clones see the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// Empty database with no failures armed.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Committed rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Rows stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// DDL statements in execution order.
    pub fn ddl_log(&self) -> Vec<String> {
        self.lock().ddl.clone()
    }

    /// Declare an existing column, as if an older schema had created it.
    pub fn add_column(&self, table: &str, column: &str) {
        self.lock()
            .columns
            .insert((table.to_string(), column.to_string()));
    }

    /// Make every insert into `table` fail.
    pub fn fail_inserts_into(&self, table: &str) {
        self.lock().failing_tables.insert(table.to_string());
    }

    /// Disarm every injected failure.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_tables.clear();
        state.fail_ddl = 0;
    }

    /// Fail the next `count` DDL statements.
    pub fn fail_next_ddl(&self, count: u32) {
        self.lock().fail_ddl = count;
    }

    /// Transactions committed so far.
    pub fn commits(&self) -> u32 {
        self.lock().commits
    }

    /// Transactions rolled back so far.
    pub fn rollbacks(&self) -> u32 {
        self.lock().rollbacks
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn ensure_open(state: &MemoryState) -> AppResult<()> {
        if state.closed {
            Err(MonitorError::Persistence("pool closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn execute(&self, statement: &str) -> AppResult<()> {
        let mut state = self.lock();
        Self::ensure_open(&state)?;
        if state.fail_ddl > 0 {
            state.fail_ddl -= 1;
            return Err(MonitorError::Persistence(format!(
                "DDL rejected: {}",
                statement.lines().next().unwrap_or_default()
            )));
        }
        state.ddl.push(statement.to_string());
        if let Some((table, column)) = parse_add_column(statement) {
            state.columns.insert((table, column));
        }
        Ok(())
    }

    async fn column_exists(&self, table: &str, column: &str) -> AppResult<bool> {
        let state = self.lock();
        Self::ensure_open(&state)?;
        Ok(state
            .columns
            .contains(&(table.to_string(), column.to_string())))
    }

    async fn begin(&self) -> AppResult<Box<dyn BatchTransaction>> {
        Self::ensure_open(&self.lock())?;
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            staged: BTreeMap::new(),
        }))
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

fn parse_add_column(statement: &str) -> Option<(String, String)> {
    let rest = statement.strip_prefix("ALTER TABLE `")?;
    let (table, rest) = rest.split_once('`')?;
    let rest = rest.trim_start().strip_prefix("ADD COLUMN `")?;
    let (column, _) = rest.split_once('`')?;
    Some((table.to_string(), column.to_string()))
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    staged: BTreeMap<String, Vec<(usize, Row)>>,
}

#[async_trait]
impl BatchTransaction for MemoryTransaction {
    async fn insert_rows(&mut self, statement: &InsertStatement, rows: &[Row]) -> AppResult<u64> {
        {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            MemoryBackend::ensure_open(&state)?;
            if state.failing_tables.contains(statement.table) {
                return Err(MonitorError::Persistence(format!(
                    "insert into {} failed",
                    statement.table
                )));
            }
        }
        for row in rows {
            if row.len() != statement.columns.len() {
                return Err(MonitorError::Persistence(format!(
                    "{} expects {} columns, got {}",
                    statement.table,
                    statement.columns.len(),
                    row.len()
                )));
            }
        }
        self.staged
            .entry(statement.table.to_string())
            .or_default()
            .extend(rows.iter().map(|row| (key_len(statement), row.clone())));
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryTransaction { state, staged } = *self;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        MemoryBackend::ensure_open(&state)?;
        for (table, rows) in staged {
            let committed = state.tables.entry(table).or_default();
            for (key_len, row) in rows {
                let duplicate = key_len > 0
                    && committed
                        .iter()
                        .any(|existing| existing[..key_len] == row[..key_len]);
                if !duplicate {
                    committed.push(row);
                }
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.rollbacks += 1;
        Ok(())
    }
}

fn key_len(statement: &InsertStatement) -> usize {
    match statement.conflict {
        ConflictPolicy::IgnoreDuplicates => statement.key_len,
        ConflictPolicy::Append => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::record::{RecordKind, SqlValue};
    use crate::persistence::schema::insert_statement;

    #[tokio::test]
    async fn rollback_discards_staged_rows() {
        let backend = MemoryBackend::new();
        let statement = insert_statement(RecordKind::Fire);
        let row = vec![
            SqlValue::Text("2024-01-01 00:00:00".into()),
            SqlValue::Int(0),
            SqlValue::Bool(false),
            SqlValue::Bool(false),
        ];

        let mut tx = backend.begin().await.unwrap();
        tx.insert_rows(statement, &[row.clone()]).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(backend.row_count("FIRE_DATA"), 0);

        let mut tx = backend.begin().await.unwrap();
        tx.insert_rows(statement, &[row.clone(), row]).await.unwrap();
        tx.commit().await.unwrap();
        // Same datetime key twice: INSERT IGNORE keeps one.
        assert_eq!(backend.row_count("FIRE_DATA"), 1);
        assert_eq!(backend.commits(), 1);
        assert_eq!(backend.rollbacks(), 1);
    }

    #[tokio::test]
    async fn alter_statements_register_columns() {
        let backend = MemoryBackend::new();
        assert!(!backend.column_exists("VOC_DATA", "unit").await.unwrap());
        backend
            .execute("ALTER TABLE `VOC_DATA` ADD COLUMN `unit` VARCHAR(16) NULL")
            .await
            .unwrap();
        assert!(backend.column_exists("VOC_DATA", "unit").await.unwrap());
    }

    #[tokio::test]
    async fn closed_backend_refuses_work() {
        let backend = MemoryBackend::new();
        backend.close().await;
        assert!(backend.is_closed());
        assert!(backend.begin().await.is_err());
        assert!(backend.execute("SELECT 1").await.is_err());
    }
}
