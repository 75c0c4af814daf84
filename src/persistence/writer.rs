//! Timer-driven batch writer.
//!
//! Lifecycle:
//! 1. create tables, indexes and missing columns; on failure wait
//!    `setup_retry` and try again, the flush timer does not start before
//!    the schema is ready
//! 2. every `flush_interval`, drain what is queued, group it by record kind
//!    and write every group inside one transaction
//! 3. on stop, flush once more and close the pool
//!
//! A failed flush rolls the whole transaction back. The drained items are
//! not requeued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::error::AppResult;
use crate::persistence::backend::PersistenceBackend;
use crate::persistence::queue::PersistenceReceiver;
use crate::persistence::record::{PersistenceItem, RecordKind, Row};
use crate::persistence::schema::{insert_statement, MIGRATIONS, TABLES};

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Queue items drained.
    pub items: usize,
    /// Rows after flattening list payloads.
    pub rows: usize,
    /// Record kinds written.
    pub kinds: usize,
    /// Rows the database reported as inserted.
    pub inserted: u64,
}

/// Drains the persistence queue into the database in batches.
pub struct BatchPersistenceWriter {
    backend: Arc<dyn PersistenceBackend>,
    receiver: PersistenceReceiver,
    flush_interval: Duration,
    setup_retry: Duration,
}

impl BatchPersistenceWriter {
    /// Writer using the intervals of `[database]`.
    pub fn new(
        backend: Arc<dyn PersistenceBackend>,
        receiver: PersistenceReceiver,
        config: &DatabaseConfig,
    ) -> Self {
        Self::with_intervals(backend, receiver, config.flush_interval, config.setup_retry)
    }

    /// Writer with explicit flush and setup-retry intervals.
    pub fn with_intervals(
        backend: Arc<dyn PersistenceBackend>,
        receiver: PersistenceReceiver,
        flush_interval: Duration,
        setup_retry: Duration,
    ) -> Self {
        Self {
            backend,
            receiver,
            flush_interval,
            setup_retry,
        }
    }

    /// Items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Create every table and index and apply missing column migrations.
    pub async fn ensure_schema(&self) -> AppResult<()> {
        for table in &TABLES {
            self.backend.execute(table.create).await?;
            for index in table.indexes {
                self.backend.execute(index).await?;
            }
        }
        for migration in &MIGRATIONS {
            if !self
                .backend
                .column_exists(migration.table, migration.column)
                .await?
            {
                self.backend.execute(&migration.alter_statement()).await?;
                info!(
                    table = migration.table,
                    column = migration.column,
                    "Added missing column"
                );
            }
        }
        info!("Database tables and indexes are ready");
        Ok(())
    }

    /// Group items by kind, flattening list payloads into their group.
    pub fn group(items: Vec<PersistenceItem>) -> BTreeMap<RecordKind, Vec<Row>> {
        let mut groups: BTreeMap<RecordKind, Vec<Row>> = BTreeMap::new();
        for item in items {
            groups.entry(item.kind).or_default().extend(item.into_rows());
        }
        groups.retain(|_, rows| !rows.is_empty());
        groups
    }

    /// Drain the queue and write everything in one transaction.
    pub async fn flush(&mut self) -> AppResult<FlushReport> {
        let items = self.receiver.drain_available();
        if items.is_empty() {
            return Ok(FlushReport::default());
        }
        let item_count = items.len();
        let groups = Self::group(items);
        let mut report = FlushReport {
            items: item_count,
            rows: groups.values().map(Vec::len).sum(),
            kinds: groups.len(),
            inserted: 0,
        };

        let mut tx = self.backend.begin().await?;
        for (kind, rows) in &groups {
            match tx.insert_rows(insert_statement(*kind), rows).await {
                Ok(inserted) => report.inserted += inserted,
                Err(err) => {
                    error!(
                        table = kind.table(),
                        items = item_count,
                        error = %err,
                        "DB insert error, rolling back batch"
                    );
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "Rollback failed");
                    }
                    return Err(err);
                }
            }
        }
        tx.commit().await?;

        info!(
            items = report.items,
            rows = report.rows,
            inserted = report.inserted,
            "Inserted batch"
        );
        Ok(report)
    }

    /// Run until `stop` fires (or its sender is dropped).
    ///
    /// Returns the outcome of the final flush.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) -> AppResult<FlushReport> {
        loop {
            match self.ensure_schema().await {
                Ok(()) => break,
                Err(err) => {
                    error!(
                        error = %err,
                        retry_in = ?self.setup_retry,
                        "DB table/index setup failed"
                    );
                    tokio::select! {
                        _ = &mut stop => {
                            let dropped = self.receiver.drain_available().len();
                            if dropped > 0 {
                                warn!(items = dropped, "Stopping before schema setup, queued items dropped");
                            }
                            self.backend.close().await;
                            return Ok(FlushReport::default());
                        }
                        _ = sleep(self.setup_retry) => {}
                    }
                }
            }
        }

        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.flush_interval, "Database writer started");

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    match self.flush().await {
                        Ok(report) if report.items == 0 => debug!("Nothing to flush"),
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "Batch dropped"),
                    }
                }
            }
        }

        info!(pending = self.pending(), "Processing remaining items before stopping DB writer");
        let last = self.flush().await;
        if let Err(err) = &last {
            error!(error = %err, "Final flush failed");
        }
        self.backend.close().await;
        info!("DB writer stopped");
        last
    }
}
