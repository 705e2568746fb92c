//! Initial-snapshot providers.
//!
//! A subscriber receives up to `snapshot_limit` recent records for a topic
//! before any live updates. Providers are read-only collaborators; the hub
//! calls them from a dedicated worker task.

mod factory;
mod memory_backend;
mod postgres_backend;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::topic::Topic;

pub use factory::create_snapshot_provider;
pub use memory_backend::MemorySnapshotStore;
pub use postgres_backend::PostgresSnapshotStore;

/// Errors returned by snapshot providers
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// PostgreSQL query failed
    #[error("PostgreSQL error: {0}")]
    Database(#[from] sqlx::Error),

    /// The topic has no backing collection (the wildcard)
    #[error("No snapshot source for topic '{0}'")]
    UnsupportedTopic(Topic),

    /// Backend is temporarily unavailable
    #[error("Snapshot backend unavailable: {0}")]
    Unavailable(String),
}

/// Source of initial snapshots for newly subscribed connections
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Fetch at most `limit` records for a concrete topic, newest first
    async fn fetch_snapshot(&self, topic: Topic, limit: usize) -> Result<Vec<Value>, SnapshotError>;

    /// Observe a published change. Backends that keep their own copy of
    /// recent records use this to stay current; others ignore it.
    fn record_change(&self, _topic: Topic, _payload: &Value) {}

    /// Backend name for logs and stats
    fn backend_name(&self) -> &'static str;
}
