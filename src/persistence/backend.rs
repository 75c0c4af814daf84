//! Storage seam of the batch writer.
//!
//! The writer only needs DDL execution, a column lookup and a transaction
//! that takes multi-row inserts. [`crate::persistence::mysql::MySqlBackend`]
//! implements it on a sqlx pool, [`crate::persistence::memory::MemoryBackend`]
//! in memory for tests and database-less runs.

use async_trait::async_trait;

use crate::error::AppResult;
use crate::persistence::record::Row;
use crate::persistence::schema::InsertStatement;

/// Database seen by the batch writer.
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Run one DDL statement.
    async fn execute(&self, statement: &str) -> AppResult<()>;

    /// Whether `table.column` exists in the current database.
    async fn column_exists(&self, table: &str, column: &str) -> AppResult<bool>;

    /// Start a transaction on one pooled connection.
    async fn begin(&self) -> AppResult<Box<dyn BatchTransaction>>;

    /// Close the pool. Further calls fail.
    async fn close(&self);
}

/// Open transaction. Dropping it without `commit` discards every insert.
#[async_trait]
pub trait BatchTransaction: Send {
    /// Insert `rows` with one or more multi-row statements.
    ///
    /// Returns the number of rows the database reported as affected;
    /// ignored duplicates are not counted.
    async fn insert_rows(&mut self, statement: &InsertStatement, rows: &[Row]) -> AppResult<u64>;

    /// Make every insert durable.
    async fn commit(self: Box<Self>) -> AppResult<()>;

    /// Discard every insert.
    async fn rollback(self: Box<Self>) -> AppResult<()>;
}
