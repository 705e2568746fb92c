use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::connection_manager::{Connection, ConnectionId, ConnectionRegistry, DisconnectReason};
use crate::metrics::{ConnectionMetrics, MessageMetrics, SubscriptionMetrics};
use crate::topic::Topic;
use crate::websocket::{Envelope, OutboundMessage};

/// Threshold for serializing once and sharing the JSON across recipients
const PRESERIALIZATION_THRESHOLD: usize = 4;

/// Outcome of one publish
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    pub topic: Topic,
    /// Connections the update was enqueued for
    pub delivered: usize,
    /// Connections whose buffer was closed or full
    pub failed: usize,
    /// Connections removed from the registry because delivery failed
    pub evicted: Vec<ConnectionId>,
}

/// Cumulative publish counters
#[derive(Debug, Default)]
pub struct RouterStats {
    pub total_published: AtomicU64,
    pub total_delivered: AtomicU64,
    pub total_failed: AtomicU64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            total_published: self.total_published.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatsSnapshot {
    pub total_published: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
}

/// Fans published changes out to topic subscribers
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    stats: RouterStats,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Deliver one `update` envelope to every subscriber of `topic` and of
    /// `all`. Never blocks: each delivery is a `try_send`, and a connection
    /// that cannot take the message is evicted without affecting the rest.
    #[tracing::instrument(name = "publish", skip(self, payload), fields(topic = %topic))]
    pub fn publish(&self, topic: Topic, payload: Value) -> DeliveryReport {
        let start = Instant::now();
        let targets = self.registry.fan_out_targets(topic);
        let envelope = Envelope::update(topic, payload);

        let outbound = if targets.len() >= PRESERIALIZATION_THRESHOLD {
            match OutboundMessage::preserialize(&envelope) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pre-serialize update, sharing envelope instead");
                    OutboundMessage::envelope(envelope)
                }
            }
        } else {
            OutboundMessage::envelope(envelope)
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for conn in &targets {
            match conn.deliver(topic, outbound.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id, error = %e, "Update delivery failed");
                    failed.push(conn.clone());
                }
            }
        }

        let evicted: Vec<ConnectionId> = failed
            .iter()
            .filter(|conn| evict(&self.registry, conn, DisconnectReason::SlowConsumer))
            .map(|conn| conn.id)
            .collect();

        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .total_failed
            .fetch_add(failed.len() as u64, Ordering::Relaxed);
        MessageMetrics::record_published(topic, delivered, failed.len(), start.elapsed());

        tracing::debug!(
            delivered = delivered,
            failed = failed.len(),
            "Published update"
        );

        DeliveryReport {
            topic,
            delivered,
            failed: failed.len(),
            evicted,
        }
    }
}

/// Remove a connection from the registry and ask its writer to close.
///
/// Returns true if this call removed it; metrics are recorded only then, so
/// racing evictions of the same connection count once.
pub(crate) fn evict(
    registry: &ConnectionRegistry,
    connection: &Connection,
    reason: DisconnectReason,
) -> bool {
    let removed = registry.remove(connection.id).is_some();
    connection.close(reason);

    if removed {
        tracing::info!(connection_id = %connection.id, reason = %reason, "Connection evicted");
        ConnectionMetrics::record_closed(reason.as_str(), registry.len());
        SubscriptionMetrics::refresh(&registry.stats());
    }
    removed
}
