//! Snapshot provider factory

use std::sync::Arc;

use crate::config::SnapshotConfig;

use super::memory_backend::MemorySnapshotStore;
use super::postgres_backend::PostgresSnapshotStore;
use super::SnapshotProvider;

/// Create a snapshot provider based on configuration.
///
/// - `"postgres"`: a `PostgresSnapshotStore` when `database_url` is set and
///   reachable
/// - `"memory"` (default): a `MemorySnapshotStore` fed by publishes
///
/// A postgres backend that cannot be created falls back to memory so the hub
/// still starts.
pub async fn create_snapshot_provider(config: &SnapshotConfig) -> Arc<dyn SnapshotProvider> {
    match config.backend.as_str() {
        "postgres" => match config.database_url.as_deref() {
            Some(url) => match PostgresSnapshotStore::connect(config, url).await {
                Ok(store) => {
                    tracing::info!(backend = "postgres", "Creating PostgreSQL snapshot backend");
                    Arc::new(store)
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "PostgreSQL snapshot backend unavailable, falling back to memory"
                    );
                    Arc::new(MemorySnapshotStore::new(config.retention))
                }
            },
            None => {
                tracing::warn!(
                    "PostgreSQL snapshot backend requested but no database_url set, falling back to memory"
                );
                Arc::new(MemorySnapshotStore::new(config.retention))
            }
        },
        _ => {
            tracing::info!(
                backend = "memory",
                retention = config.retention,
                "Creating memory snapshot backend"
            );
            Arc::new(MemorySnapshotStore::new(config.retention))
        }
    }
}
