use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::broadcast::DeliveryReport;
use crate::config::RedisConfig;
use crate::error::{AppError, Result};
use crate::hub::Hub;
use crate::metrics::TriggerMetrics;

use super::resolve_publish_topic;

/// Change notification received on `{channel_prefix}:*`
#[derive(Debug, Deserialize)]
pub struct ChangeMessage {
    /// Topic name; defaults to the channel suffix after the prefix
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Consumes data-change notifications from Redis Pub/Sub and publishes them
/// to the hub
pub struct RedisChangeFeed {
    config: RedisConfig,
    hub: Arc<Hub>,
}

impl RedisChangeFeed {
    pub fn new(config: RedisConfig, hub: Arc<Hub>) -> Self {
        Self { config, hub }
    }

    fn pattern(&self) -> String {
        format!("{}:*", self.config.channel_prefix)
    }

    /// Run until the hub shuts down, reconnecting after failures
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.config.enabled {
            tracing::info!("Redis change feed disabled");
            return Ok(());
        }

        let mut shutdown = self.hub.shutdown_signal();
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        tracing::info!(pattern = %self.pattern(), "Starting Redis change feed");

        loop {
            match self.run_subscription_loop(&mut shutdown).await {
                Ok(()) => {
                    tracing::info!("Redis change feed stopped gracefully");
                    break;
                }
                Err(e) => {
                    TriggerMetrics::set_redis_connected(false);
                    tracing::error!(
                        error = %e,
                        retry_in_ms = self.config.reconnect_delay_ms,
                        "Redis subscription error, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        TriggerMetrics::set_redis_connected(false);
        Ok(())
    }

    async fn run_subscription_loop(&self, shutdown: &mut broadcast::Receiver<()>) -> anyhow::Result<()> {
        let client = redis::Client::open(self.config.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(self.pattern()).await?;

        TriggerMetrics::set_redis_connected(true);
        tracing::info!("Redis subscription established");

        let mut message_stream = pubsub.on_message();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Received shutdown signal");
                    return Ok(());
                }
                msg = message_stream.next() => {
                    let Some(msg) = msg else {
                        anyhow::bail!("Redis message stream ended");
                    };
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to get message payload");
                            TriggerMetrics::record_message("redis", "invalid");
                            continue;
                        }
                    };

                    match self.handle_message(&channel, &payload) {
                        Ok(_) => TriggerMetrics::record_message("redis", "published"),
                        Err(e) => {
                            tracing::warn!(channel = %channel, error = %e, "Rejected change message");
                            TriggerMetrics::record_message("redis", "rejected");
                        }
                    }
                }
            }
        }
    }

    /// Publish one change message received on `channel`
    pub fn handle_message(&self, channel: &str, payload: &str) -> Result<DeliveryReport> {
        let message: ChangeMessage = serde_json::from_str(payload)
            .map_err(|e| AppError::Validation(format!("invalid change message: {e}")))?;

        let topic_name = match message.topic.as_deref() {
            Some(name) => name,
            None => channel
                .strip_prefix(self.config.channel_prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                .ok_or_else(|| AppError::Validation(format!("no topic for channel '{channel}'")))?,
        };
        let topic = resolve_publish_topic(topic_name)?;

        let report = self.hub.publish(topic, message.payload);
        tracing::debug!(
            channel = %channel,
            topic = %topic,
            delivered = report.delivered,
            "Change published from Redis"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::ratelimit::RateLimitConfig;
    use crate::snapshot::MemorySnapshotStore;
    use crate::topic::Topic;
    use crate::websocket::EnvelopeKind;

    fn feed() -> (RedisChangeFeed, Arc<Hub>) {
        let hub = Hub::new(
            HubConfig::default(),
            RateLimitConfig::default(),
            Arc::new(MemorySnapshotStore::new(10)),
        );
        (RedisChangeFeed::new(RedisConfig::default(), hub.clone()), hub)
    }

    #[tokio::test]
    async fn test_topic_from_channel_suffix() {
        let (feed, hub) = feed();
        let (conn, mut rx) = hub.connect();
        hub.registry().subscribe(conn.id, Topic::Users);
        rx.recv().await.unwrap(); // connected

        let report = feed
            .handle_message("realtime:changes:users", r#"{"payload": {"id": 3}}"#)
            .unwrap();
        assert_eq!(report.topic, Topic::Users);
        assert_eq!(report.delivered, 1);

        let envelope = rx.recv().await.unwrap().decode().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Update);
        assert_eq!(envelope.payload["id"], 3);
    }

    #[tokio::test]
    async fn test_explicit_topic_wins() {
        let (feed, _hub) = feed();
        let report = feed
            .handle_message("realtime:changes:misc", r#"{"topic": "orders", "payload": {}}"#)
            .unwrap();
        assert_eq!(report.topic, Topic::Orders);
    }

    #[tokio::test]
    async fn test_invalid_messages_are_rejected() {
        let (feed, _hub) = feed();
        assert!(feed.handle_message("realtime:changes:users", "nope").is_err());
        assert!(feed.handle_message("other:users", r#"{"payload": 1}"#).is_err());
        assert!(feed
            .handle_message("realtime:changes:all", r#"{"payload": 1}"#)
            .is_err());
    }

    #[tokio::test]
    async fn test_disabled_feed_returns_immediately() {
        let (feed, _hub) = feed();
        tokio_test::assert_ok!(feed.start().await);
    }
}
