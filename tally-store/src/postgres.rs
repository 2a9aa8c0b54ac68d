use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tally_core::config::StoreConfig;
use tally_core::{LogEntry, TallyError};
use tally_recorder::Persister;
use tracing::{debug, info};

/// Writes each batch as one multi-row `INSERT` into the request log table.
///
/// The table is expected to exist already:
///
/// ```sql
/// CREATE TABLE request_logs (
///     request  JSONB NOT NULL,
///     response JSONB NOT NULL,
///     ts       TIMESTAMPTZ NOT NULL
/// );
/// ```
#[derive(Debug, Clone)]
pub struct PgPersister {
    pool: PgPool,
    table: String,
}

impl PgPersister {
    pub fn new(pool: PgPool, table: &str) -> Self {
        Self {
            pool,
            table: table.to_string(),
        }
    }

    /// Build a pool that connects on first use, so startup never waits on
    /// the database. Must be called inside a tokio runtime.
    pub fn connect_lazy(config: &StoreConfig) -> Result<Self, TallyError> {
        let url = config
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| TallyError::Config("DB_URL is required".into()))?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_lazy(url)
            .map_err(|e| TallyError::Config(format!("invalid store url: {e}")))?;

        info!(
            table = %config.table,
            max_connections = config.max_connections,
            "PostgreSQL store configured"
        );
        Ok(Self::new(pool, &config.table))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Close every pooled connection. Call after the recorder has drained.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// `INSERT INTO <table> (request, response, ts) VALUES (..), (..)` with one
/// row per entry, in batch order.
fn insert_query<'a>(table: &str, batch: &'a [LogEntry]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} (request, response, ts) "));
    qb.push_values(batch, |mut row, entry| {
        row.push_bind(Json(&entry.request))
            .push_bind(Json(&entry.response))
            .push_bind(entry.timestamp);
    });
    qb
}

#[async_trait]
impl Persister for PgPersister {
    async fn persist(&self, batch: &[LogEntry]) -> Result<(), TallyError> {
        if batch.is_empty() {
            return Ok(());
        }

        let result = insert_query(&self.table, batch)
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| TallyError::Persistence(e.to_string()))?;

        debug!(rows = result.rows_affected(), table = %self.table, "Inserted request logs");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
