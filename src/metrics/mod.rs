//! Prometheus metrics for the realtime hub.
//!
//! - Connection metrics (active connections, disconnect reasons)
//! - Subscription metrics (active topics, subscribers per topic)
//! - Publish metrics (published, delivered, failed, latency)
//! - Rate limiting, heartbeat and snapshot metrics

mod helpers;

pub use helpers::{
    encode_metrics, ConnectionMetrics, HeartbeatMetrics, MessageMetrics, RateLimitMetrics,
    SnapshotMetrics, SubscriptionMetrics, TriggerMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "realtime";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of active WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of active WebSocket connections"
    ).unwrap();

    /// Connections accepted since start
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    /// Disconnections by reason
    pub static ref DISCONNECTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_disconnects_total", METRIC_PREFIX),
        "Total disconnections by reason",
        &["reason"]
    ).unwrap();

    // ============================================================================
    // Subscription Metrics
    // ============================================================================

    /// Subscribers per topic
    pub static ref TOPIC_SUBSCRIBERS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_topic_subscribers", METRIC_PREFIX),
        "Number of subscribers per topic",
        &["topic"]
    ).unwrap();

    /// Topics with at least one subscriber
    pub static ref TOPICS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_topics_active", METRIC_PREFIX),
        "Total number of topics with at least one subscriber"
    ).unwrap();

    // ============================================================================
    // Publish Metrics
    // ============================================================================

    /// Publishes by topic
    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_published_total", METRIC_PREFIX),
        "Total publish calls by topic",
        &["topic"]
    ).unwrap();

    /// Update envelopes enqueued onto connections
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total update envelopes delivered to connections"
    ).unwrap();

    /// Failed enqueues (closed or full buffers)
    pub static ref MESSAGES_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_failed_total", METRIC_PREFIX),
        "Total update delivery failures"
    ).unwrap();

    /// Time spent fanning out one publish
    pub static ref PUBLISH_LATENCY: Histogram = register_histogram!(
        format!("{}_publish_latency_seconds", METRIC_PREFIX),
        "Fan-out latency of a single publish in seconds",
        vec![0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]
    ).unwrap();

    /// Inbound WebSocket messages by type
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Total WebSocket messages received by type",
        &["type"]
    ).unwrap();

    // ============================================================================
    // Rate Limiting Metrics
    // ============================================================================

    pub static ref RATELIMIT_ALLOWED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ratelimit_allowed_total", METRIC_PREFIX),
        "Total inbound messages admitted by the rate limiter"
    ).unwrap();

    pub static ref RATELIMIT_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_ratelimit_rejected_total", METRIC_PREFIX),
        "Total inbound messages rejected by the rate limiter"
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    /// Connections evicted for missing heartbeats
    pub static ref HEARTBEAT_EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeat_evictions_total", METRIC_PREFIX),
        "Total connections evicted after missing heartbeats"
    ).unwrap();

    /// Duration of one heartbeat sweep
    pub static ref HEARTBEAT_SWEEP_DURATION: Histogram = register_histogram!(
        format!("{}_heartbeat_sweep_duration_seconds", METRIC_PREFIX),
        "Heartbeat sweep duration in seconds",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]
    ).unwrap();

    // ============================================================================
    // Snapshot Metrics
    // ============================================================================

    pub static ref SNAPSHOT_FETCH_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_snapshot_fetch_latency_seconds", METRIC_PREFIX),
        "Snapshot fetch latency in seconds",
        &["backend"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    pub static ref SNAPSHOT_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_snapshot_failures_total", METRIC_PREFIX),
        "Total failed snapshot fetches by topic",
        &["topic"]
    ).unwrap();

    // ============================================================================
    // Trigger Metrics
    // ============================================================================

    /// Redis change-feed connection status (1 = connected, 0 = disconnected)
    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis change-feed connection status (1=connected, 0=disconnected)"
    ).unwrap();

    /// Change messages received by source
    pub static ref TRIGGER_MESSAGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_trigger_messages_total", METRIC_PREFIX),
        "Total change messages received by trigger source and outcome",
        &["source", "outcome"]
    ).unwrap();
}
