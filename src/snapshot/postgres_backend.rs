//! PostgreSQL-backed snapshot store.
//!
//! Each concrete topic maps to a table of the same name; the snapshot is the
//! newest rows by primary key, serialized with `row_to_json`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::SnapshotConfig;
use crate::topic::Topic;

use super::{SnapshotError, SnapshotProvider};

pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool from configuration
    pub async fn connect(config: &SnapshotConfig, database_url: &str) -> Result<Self, SnapshotError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(database_url)
            .await?;

        tracing::info!(
            pool_size = config.pool_size,
            "PostgreSQL snapshot pool created"
        );

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SnapshotProvider for PostgresSnapshotStore {
    #[tracing::instrument(skip(self), fields(backend = "postgres"))]
    async fn fetch_snapshot(&self, topic: Topic, limit: usize) -> Result<Vec<Value>, SnapshotError> {
        let table = topic
            .table_name()
            .ok_or(SnapshotError::UnsupportedTopic(topic))?;

        // Table names come from the closed Topic enum, never from user input
        let sql = format!(
            "SELECT row_to_json(t) AS record FROM {table} t ORDER BY t.id DESC LIMIT $1"
        );

        let rows: Vec<(Value,)> = sqlx::query_as(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(record,)| record).collect())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
