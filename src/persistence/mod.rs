//! Batched persistence of polled samples.
//!
//! Pollers push [`PersistenceItem`]s into the [`queue`]; the
//! [`BatchPersistenceWriter`] drains it on a timer and writes one transaction
//! per flush through a [`PersistenceBackend`].
//!
//! - [`record`]: record kinds, rows and bound values
//! - [`queue`]: unbounded producer/consumer queue
//! - [`schema`]: DDL, insert statements and column migrations
//! - [`backend`]: storage traits
//! - [`mysql`]: sqlx MySQL/MariaDB backend
//! - [`memory`]: in-memory backend
//! - [`writer`]: the batch writer task

pub mod backend;
pub mod memory;
pub mod mysql;
pub mod queue;
pub mod record;
pub mod schema;
pub mod writer;

pub use backend::{BatchTransaction, PersistenceBackend};
pub use memory::MemoryBackend;
pub use mysql::MySqlBackend;
pub use queue::{persistence_queue, PersistenceReceiver, PersistenceSender};
pub use record::{Payload, PersistenceItem, RecordKind, Row, SqlValue};
pub use writer::{BatchPersistenceWriter, FlushReport};
