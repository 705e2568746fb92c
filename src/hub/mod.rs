//! The hub: owns the registry, router, rate limiter and snapshot worker, and
//! turns inbound frames into registry mutations and outbound envelopes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::broadcast::{evict, BroadcastRouter, DeliveryReport, RouterStatsSnapshot, SnapshotRequest, SnapshotWorker};
use crate::config::HubConfig;
use crate::connection_manager::{
    Connection, ConnectionId, ConnectionInfo, ConnectionRegistry, DisconnectReason, RegistryStats,
    SubscriptionChange,
};
use crate::error::HubError;
use crate::metrics::{ConnectionMetrics, MessageMetrics, RateLimitMetrics, SubscriptionMetrics};
use crate::ratelimit::{RateLimitConfig, RateLimitResult, RateLimiter, RateLimiterStats};
use crate::snapshot::SnapshotProvider;
use crate::topic::Topic;
use crate::websocket::{ClientMessage, Envelope, OutboundMessage};

/// Hub-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub publishing: RouterStatsSnapshot,
    pub rate_limit: RateLimiterStats,
    pub snapshot_backend: &'static str,
}

/// Explicitly constructed realtime hub. Every connection, subscription and
/// publish goes through one instance owned by the server's startup sequence.
pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    router: BroadcastRouter,
    rate_limiter: RateLimiter,
    provider: Arc<dyn SnapshotProvider>,
    snapshot_queue: mpsc::Sender<SnapshotRequest>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
}

impl Hub {
    /// Build the hub and start its snapshot worker. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: HubConfig,
        rate_limit: RateLimitConfig,
        provider: Arc<dyn SnapshotProvider>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let worker = SnapshotWorker::new(provider.clone(), registry.clone(), config.snapshot_limit);
        let (snapshot_queue, _handle) = worker.spawn(config.snapshot_queue_size, shutdown_tx.subscribe());

        tracing::info!(
            heartbeat_interval_ms = config.heartbeat_interval_ms,
            heartbeat_miss_threshold = config.heartbeat_miss_threshold,
            outbound_buffer_size = config.outbound_buffer_size,
            snapshot_limit = config.snapshot_limit,
            rate_limit_enabled = rate_limit.enabled,
            snapshot_backend = provider.backend_name(),
            "Hub created"
        );

        Arc::new(Self {
            router: BroadcastRouter::new(registry.clone()),
            rate_limiter: RateLimiter::new(rate_limit),
            config,
            registry,
            provider,
            snapshot_queue,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Receiver that fires when the hub shuts down
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Accept a new peer: allocate its outbound buffer, register it and
    /// queue the `connected` envelope.
    pub fn connect(&self) -> (Arc<Connection>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(self.config.outbound_buffer_size.max(1));
        let connection = self.register(tx);
        (connection, rx)
    }

    /// Register a connection around an existing outbound channel
    #[tracing::instrument(name = "connect", skip_all)]
    pub fn register(&self, sender: mpsc::Sender<OutboundMessage>) -> Arc<Connection> {
        let connection = self.registry.register(sender);
        ConnectionMetrics::record_opened(self.registry.len());

        if self.is_shutting_down() {
            evict(&self.registry, &connection, DisconnectReason::Shutdown);
            return connection;
        }

        self.reply(&connection, Envelope::connected(connection.id));
        connection
    }

    /// Handle one inbound text frame
    pub fn handle_text(&self, connection: &Arc<Connection>, text: &str) {
        if !self.admit(connection) {
            return;
        }

        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                MessageMetrics::record_received("malformed");
                tracing::debug!(connection_id = %connection.id, error = %e, "Malformed client message");
                self.reply_error(connection, &HubError::MalformedMessage(e.to_string()));
                return;
            }
        };

        MessageMetrics::record_received(message.kind());

        let result = match message {
            ClientMessage::Subscribe { subscribe } => self.subscribe(connection, &subscribe),
            ClientMessage::Unsubscribe { unsubscribe } => self.unsubscribe(connection, &unsubscribe),
            ClientMessage::Ping { ping } => {
                self.reply(connection, Envelope::heartbeat_echo(ping));
                Ok(())
            }
            // Liveness already recorded by admit
            ClientMessage::Pong { .. } => Ok(()),
        };

        if let Err(e) = result {
            self.reply_error(connection, &e);
        }
    }

    /// Binary frames are not part of the protocol
    pub fn reject_binary(&self, connection: &Connection) {
        if !self.admit(connection) {
            return;
        }
        MessageMetrics::record_received("binary");
        self.reply_error(
            connection,
            &HubError::MalformedMessage("binary frames are not supported".to_string()),
        );
    }

    /// Record liveness and count the frame against the rate limit.
    /// Returns false when the frame must be dropped.
    fn admit(&self, connection: &Connection) -> bool {
        connection.record_activity();
        connection.record_inbound();

        match self.rate_limiter.admit(connection.id) {
            RateLimitResult::Allowed { .. } => {
                RateLimitMetrics::record_allowed();
                true
            }
            RateLimitResult::Rejected { count, retry_after } => {
                RateLimitMetrics::record_rejected();
                tracing::warn!(
                    connection_id = %connection.id,
                    count = count,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                self.reply_error(connection, &HubError::RateLimitExceeded);
                false
            }
        }
    }

    /// Subscribe a connection to a topic by name.
    ///
    /// Sends `subscribed` and then schedules a snapshot for each concrete
    /// topic covered (every concrete topic for `all`). Updates for those
    /// topics are held until their snapshot is queued.
    #[tracing::instrument(name = "subscribe", skip(self, connection), fields(connection_id = %connection.id))]
    pub fn subscribe(&self, connection: &Arc<Connection>, topic: &str) -> Result<(), HubError> {
        let topic: Topic = topic.parse()?;
        let snapshot_topics = topic.expand();

        for t in &snapshot_topics {
            connection.hold_for_snapshot(*t);
        }

        match self.registry.subscribe(connection.id, topic) {
            SubscriptionChange::UnknownConnection => {
                for t in &snapshot_topics {
                    connection.cancel_snapshot(*t);
                }
                return Err(HubError::TransportError("connection is not registered".to_string()));
            }
            SubscriptionChange::Applied => {
                SubscriptionMetrics::refresh(&self.registry.stats());
                tracing::info!(topic = %topic, "Subscribed");
            }
            SubscriptionChange::Unchanged => {
                tracing::debug!(topic = %topic, "Already subscribed");
            }
        }

        self.reply(connection, Envelope::subscribed(topic));

        for t in snapshot_topics {
            let request = SnapshotRequest {
                connection: connection.clone(),
                topic: t,
            };
            if let Err(e) = self.snapshot_queue.try_send(request) {
                tracing::warn!(topic = %t, error = %e, "Snapshot queue unavailable");
                let error = HubError::SnapshotFetchFailed {
                    topic: t,
                    message: "snapshot queue is full".to_string(),
                };
                if connection.complete_snapshot(t, Envelope::error(&error)).is_err() {
                    evict(&self.registry, connection, DisconnectReason::SlowConsumer);
                }
            }
        }

        Ok(())
    }

    /// Unsubscribe a connection from a topic by name. Idempotent.
    #[tracing::instrument(name = "unsubscribe", skip(self, connection), fields(connection_id = %connection.id))]
    pub fn unsubscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError> {
        let topic: Topic = topic.parse()?;

        match self.registry.unsubscribe(connection.id, topic) {
            SubscriptionChange::Applied => {
                let remaining = self.registry.subscriptions(connection.id).unwrap_or_default();
                for t in topic.expand() {
                    if !t.covered_by(&remaining) {
                        connection.discard_pending(t);
                    }
                }
                SubscriptionMetrics::refresh(&self.registry.stats());
                tracing::info!(topic = %topic, "Unsubscribed");
            }
            SubscriptionChange::Unchanged => {}
            SubscriptionChange::UnknownConnection => {
                return Err(HubError::TransportError("connection is not registered".to_string()));
            }
        }

        self.reply(connection, Envelope::unsubscribed(topic));
        Ok(())
    }

    /// Publish a change to every subscriber of `topic` and of `all`
    pub fn publish(&self, topic: Topic, payload: Value) -> DeliveryReport {
        self.provider.record_change(topic, &payload);
        self.router.publish(topic, payload)
    }

    /// Remove a connection and release its rate-limit state. Idempotent.
    pub fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) {
        self.rate_limiter.release(id);

        if let Some(removed) = self.registry.remove(id) {
            removed.connection.close(reason);
            ConnectionMetrics::record_closed(reason.as_str(), self.registry.len());
            SubscriptionMetrics::refresh(&self.registry.stats());
            tracing::info!(
                connection_id = %id,
                reason = %reason,
                subscriptions = removed.subscriptions.len(),
                "Connection closed"
            );
        }
    }

    /// Signal background tasks to stop and close every connection
    pub fn shutdown(&self) -> usize {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let _ = self.shutdown_tx.send(());

        let connections = self.registry.drain();
        for connection in &connections {
            self.rate_limiter.release(connection.id);
            connection.close(DisconnectReason::Shutdown);
            ConnectionMetrics::record_closed(DisconnectReason::Shutdown.as_str(), 0);
        }
        SubscriptionMetrics::refresh(&self.registry.stats());

        tracing::info!(closed = connections.len(), "Hub shut down");
        connections.len()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connection_infos(&self) -> Vec<ConnectionInfo> {
        self.registry.connection_infos()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            registry: self.registry.stats(),
            publishing: self.router.stats(),
            rate_limit: self.rate_limiter.stats(),
            snapshot_backend: self.provider.backend_name(),
        }
    }

    /// Queue a control envelope, evicting the connection if its buffer
    /// cannot take it
    fn reply(&self, connection: &Connection, envelope: Envelope) {
        if let Err(e) = connection.send_envelope(envelope) {
            tracing::debug!(connection_id = %connection.id, error = %e, "Reply delivery failed");
            evict(&self.registry, connection, DisconnectReason::SlowConsumer);
        }
    }

    fn reply_error(&self, connection: &Connection, error: &HubError) {
        self.reply(connection, Envelope::error(error));
    }
}
