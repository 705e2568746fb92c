//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::RegistryStats;
use crate::topic::Topic;

use super::{
    CONNECTIONS_OPENED_TOTAL, CONNECTIONS_TOTAL, DISCONNECTS_TOTAL, HEARTBEAT_EVICTIONS_TOTAL,
    HEARTBEAT_SWEEP_DURATION, MESSAGES_DELIVERED_TOTAL, MESSAGES_FAILED_TOTAL,
    MESSAGES_PUBLISHED_TOTAL, PUBLISH_LATENCY, RATELIMIT_ALLOWED_TOTAL, RATELIMIT_REJECTED_TOTAL,
    REDIS_CONNECTION_STATUS, SNAPSHOT_FAILURES_TOTAL, SNAPSHOT_FETCH_LATENCY, TOPICS_ACTIVE,
    TOPIC_SUBSCRIBERS, TRIGGER_MESSAGES_TOTAL, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened(active: usize) {
        CONNECTIONS_OPENED_TOTAL.inc();
        CONNECTIONS_TOTAL.set(active as i64);
    }

    pub fn record_closed(reason: &str, active: usize) {
        DISCONNECTS_TOTAL.with_label_values(&[reason]).inc();
        CONNECTIONS_TOTAL.set(active as i64);
    }

    pub fn set_active(active: usize) {
        CONNECTIONS_TOTAL.set(active as i64);
    }
}

pub struct SubscriptionMetrics;

impl SubscriptionMetrics {
    /// Mirror the registry's per-topic counts into the gauges
    pub fn refresh(stats: &RegistryStats) {
        TOPICS_ACTIVE.set(stats.topics.len() as i64);
        for topic in Topic::CONCRETE.iter().chain(std::iter::once(&Topic::All)) {
            let count = stats.topics.get(topic.as_str()).copied().unwrap_or(0);
            TOPIC_SUBSCRIBERS
                .with_label_values(&[topic.as_str()])
                .set(count as i64);
        }
    }
}

/// Helper struct for recording publish metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub fn record_published(topic: Topic, delivered: usize, failed: usize, elapsed: Duration) {
        MESSAGES_PUBLISHED_TOTAL
            .with_label_values(&[topic.as_str()])
            .inc();
        MESSAGES_DELIVERED_TOTAL.inc_by(delivered as u64);
        MESSAGES_FAILED_TOTAL.inc_by(failed as u64);
        PUBLISH_LATENCY.observe(elapsed.as_secs_f64());
    }

    pub fn record_received(kind: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[kind]).inc();
    }
}

pub struct RateLimitMetrics;

impl RateLimitMetrics {
    pub fn record_allowed() {
        RATELIMIT_ALLOWED_TOTAL.inc();
    }

    pub fn record_rejected() {
        RATELIMIT_REJECTED_TOTAL.inc();
    }
}

pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_sweep(elapsed: Duration, evicted: usize) {
        HEARTBEAT_SWEEP_DURATION.observe(elapsed.as_secs_f64());
        HEARTBEAT_EVICTIONS_TOTAL.inc_by(evicted as u64);
    }
}

pub struct SnapshotMetrics;

impl SnapshotMetrics {
    pub fn record_fetch(backend: &str, elapsed: Duration) {
        SNAPSHOT_FETCH_LATENCY
            .with_label_values(&[backend])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(topic: Topic) {
        SNAPSHOT_FAILURES_TOTAL
            .with_label_values(&[topic.as_str()])
            .inc();
    }
}

pub struct TriggerMetrics;

impl TriggerMetrics {
    pub fn record_message(source: &str, outcome: &str) {
        TRIGGER_MESSAGES_TOTAL
            .with_label_values(&[source, outcome])
            .inc();
    }

    pub fn set_redis_connected(connected: bool) {
        REDIS_CONNECTION_STATUS.set(i64::from(connected));
    }
}
