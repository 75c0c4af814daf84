//! MySQL/MariaDB backend on a sqlx connection pool.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::AppResult;
use crate::persistence::backend::{BatchTransaction, PersistenceBackend};
use crate::persistence::record::{Row, SqlValue};
use crate::persistence::schema::InsertStatement;

/// Bind parameters allowed in one prepared statement.
const MAX_PLACEHOLDERS: usize = 65_535;

/// MySQL/MariaDB backend on a `sqlx` pool.
pub struct MySqlBackend {
    pool: MySqlPool,
}

impl MySqlBackend {
    /// Open the pool. A unix socket, when configured, wins over host/port.
    pub async fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let options = MySqlConnectOptions::new()
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);
        let options = match &config.unix_socket {
            Some(path) => options.socket(path),
            None => options.host(&config.host).port(config.port),
        };

        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!(
            database = %config.database,
            pool_size = config.pool_size,
            "Database connection pool ready"
        );
        Ok(Self { pool })
    }

    /// Use an existing pool.
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceBackend for MySqlBackend {
    async fn execute(&self, statement: &str) -> AppResult<()> {
        sqlx::raw_sql(statement).execute(&self.pool).await?;
        Ok(())
    }

    async fn column_exists(&self, table: &str, column: &str) -> AppResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = ?",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn begin(&self) -> AppResult<Box<dyn BatchTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(MySqlBatch { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct MySqlBatch {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl BatchTransaction for MySqlBatch {
    async fn insert_rows(&mut self, statement: &InsertStatement, rows: &[Row]) -> AppResult<u64> {
        let mut affected = 0;
        for chunk in rows.chunks(statement.rows_per_chunk(MAX_PLACEHOLDERS)) {
            let mut builder: QueryBuilder<MySql> = QueryBuilder::new(statement.prefix());
            builder.push_values(chunk, |mut tuple, row| {
                for value in row {
                    match value {
                        SqlValue::Null => tuple.push_bind(None::<f64>),
                        SqlValue::Bool(v) => tuple.push_bind(*v),
                        SqlValue::Int(v) => tuple.push_bind(*v),
                        SqlValue::Float(v) => tuple.push_bind(*v),
                        SqlValue::Text(v) => tuple.push_bind(v.clone()),
                        SqlValue::Timestamp(v) => tuple.push_bind(*v),
                    };
                }
            });
            let result = builder.build().execute(&mut *self.tx).await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MySqlBatch { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        let MySqlBatch { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}
