use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::connection_manager::{Connection, ConnectionRegistry, DisconnectReason};
use crate::error::HubError;
use crate::metrics::SnapshotMetrics;
use crate::snapshot::SnapshotProvider;
use crate::topic::Topic;
use crate::websocket::Envelope;

use super::router::evict;

/// Maximum snapshot fetches in flight at once
const MAX_CONCURRENT_FETCHES: usize = 16;

/// One snapshot to fetch and deliver. The connection's gate for `topic` is
/// already held; the worker must release it exactly once.
#[derive(Debug)]
pub struct SnapshotRequest {
    pub connection: Arc<Connection>,
    pub topic: Topic,
}

/// Fetches snapshots off the connection reader's path
pub struct SnapshotWorker {
    provider: Arc<dyn SnapshotProvider>,
    registry: Arc<ConnectionRegistry>,
    limit: usize,
    permits: Arc<Semaphore>,
}

impl SnapshotWorker {
    pub fn new(
        provider: Arc<dyn SnapshotProvider>,
        registry: Arc<ConnectionRegistry>,
        limit: usize,
    ) -> Self {
        Self {
            provider,
            registry,
            limit,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_FETCHES)),
        }
    }

    /// Start the worker, returning the request queue
    pub fn spawn(
        self,
        queue_size: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> (mpsc::Sender<SnapshotRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let handle = tokio::spawn(self.run(rx, shutdown));
        (tx, handle)
    }

    async fn run(
        self,
        mut requests: mpsc::Receiver<SnapshotRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let worker = Arc::new(self);
        tracing::info!(
            backend = worker.provider.backend_name(),
            limit = worker.limit,
            "Snapshot worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Snapshot worker received shutdown signal");
                    break;
                }
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let permit = match worker.permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let worker = worker.clone();
                    tokio::spawn(async move {
                        worker.serve(request).await;
                        drop(permit);
                    });
                }
            }
        }

        tracing::info!("Snapshot worker stopped");
    }

    /// Fetch and deliver one snapshot, or an error envelope in its place
    #[tracing::instrument(
        name = "snapshot",
        skip(self, request),
        fields(connection_id = %request.connection.id, topic = %request.topic)
    )]
    pub async fn serve(&self, request: SnapshotRequest) {
        let SnapshotRequest { connection, topic } = request;

        let covered = self
            .registry
            .subscriptions(connection.id)
            .is_some_and(|subs| topic.covered_by(&subs));
        if !covered {
            connection.cancel_snapshot(topic);
            return;
        }

        let start = Instant::now();
        let envelope = match self.provider.fetch_snapshot(topic, self.limit).await {
            Ok(mut records) => {
                records.truncate(self.limit);
                SnapshotMetrics::record_fetch(self.provider.backend_name(), start.elapsed());
                tracing::debug!(records = records.len(), "Snapshot fetched");
                Envelope::snapshot(topic, records)
            }
            Err(e) => {
                SnapshotMetrics::record_failure(topic);
                tracing::warn!(error = %e, "Snapshot fetch failed");
                Envelope::error(&HubError::SnapshotFetchFailed {
                    topic,
                    message: e.to_string(),
                })
            }
        };

        if let Err(e) = connection.complete_snapshot(topic, envelope) {
            tracing::debug!(error = %e, "Snapshot delivery failed");
            evict(&self.registry, &connection, DisconnectReason::SlowConsumer);
        }
    }
}
