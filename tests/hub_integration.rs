//! Cross-component tests driving an in-process hub through channel-backed
//! connections.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};

use realtime_hub::config::HubConfig;
use realtime_hub::connection_manager::DisconnectReason;
use realtime_hub::hub::Hub;
use realtime_hub::ratelimit::RateLimitConfig;
use realtime_hub::snapshot::{MemorySnapshotStore, SnapshotError, SnapshotProvider};
use realtime_hub::tasks::HeartbeatMonitor;
use realtime_hub::topic::Topic;
use realtime_hub::websocket::{Envelope, EnvelopeKind, OutboundMessage};

fn hub_with(config: HubConfig, rate_limit: RateLimitConfig, store: Arc<dyn SnapshotProvider>) -> Arc<Hub> {
    Hub::new(config, rate_limit, store)
}

fn default_hub() -> Arc<Hub> {
    hub_with(
        HubConfig::default(),
        RateLimitConfig::default(),
        Arc::new(MemorySnapshotStore::new(100)),
    )
}

async fn next(rx: &mut mpsc::Receiver<OutboundMessage>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("envelope within a second")
        .expect("channel open")
        .decode()
        .expect("decodable envelope")
}

async fn assert_silent(rx: &mut mpsc::Receiver<OutboundMessage>) {
    let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "unexpected envelope: {:?}", result);
}

struct FailingProvider;

#[async_trait]
impl SnapshotProvider for FailingProvider {
    async fn fetch_snapshot(&self, _topic: Topic, _limit: usize) -> Result<Vec<Value>, SnapshotError> {
        Err(SnapshotError::Unavailable("database offline".to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

#[tokio::test]
async fn test_end_to_end_products_flow() {
    let store = Arc::new(MemorySnapshotStore::new(100));
    store.seed(Topic::Products, (0..60).map(|i| json!({ "id": i })));
    let hub = hub_with(HubConfig::default(), RateLimitConfig::default(), store);

    let (conn, mut rx) = hub.connect();
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Connected);

    hub.handle_text(&conn, r#"{"subscribe": "products"}"#);
    let subscribed = next(&mut rx).await;
    assert_eq!(subscribed.kind, EnvelopeKind::Subscribed);
    assert_eq!(subscribed.topic, Some(Topic::Products));

    let snapshot = next(&mut rx).await;
    assert_eq!(snapshot.kind, EnvelopeKind::Snapshot);
    let records = snapshot.payload.as_array().expect("array payload");
    assert_eq!(records.len(), 50);
    assert_eq!(records[0]["id"], 59);

    let report = hub.publish(Topic::Products, json!({ "id": 60, "price": 10 }));
    assert_eq!(report.delivered, 1);

    let update = next(&mut rx).await;
    assert_eq!(update.kind, EnvelopeKind::Update);
    assert_eq!(update.topic, Some(Topic::Products));
    assert_eq!(update.payload["price"], 10);
    assert_silent(&mut rx).await;

    hub.handle_text(&conn, r#"{"unsubscribe": "products"}"#);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Unsubscribed);

    let report = hub.publish(Topic::Products, json!({ "id": 61 }));
    assert_eq!(report.delivered, 0);
    assert_silent(&mut rx).await;
}

/// Holds every fetch until released
struct GatedProvider {
    release: Arc<Semaphore>,
}

#[async_trait]
impl SnapshotProvider for GatedProvider {
    async fn fetch_snapshot(&self, _topic: Topic, _limit: usize) -> Result<Vec<Value>, SnapshotError> {
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))?;
        permit.forget();
        Ok(vec![json!({ "id": 0 })])
    }

    fn backend_name(&self) -> &'static str {
        "gated"
    }
}

#[tokio::test]
async fn test_unsubscribe_while_snapshot_pending_stays_silent() {
    let release = Arc::new(Semaphore::new(0));
    let hub = hub_with(
        HubConfig::default(),
        RateLimitConfig::default(),
        Arc::new(GatedProvider { release: release.clone() }),
    );
    let (conn, mut rx) = hub.connect();
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Connected);

    hub.handle_text(&conn, r#"{"subscribe": "products"}"#);
    hub.publish(Topic::Products, json!({ "id": 1 }));
    hub.handle_text(&conn, r#"{"unsubscribe": "products"}"#);

    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Subscribed);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Unsubscribed);

    release.add_permits(1);
    assert_silent(&mut rx).await;
    assert!(!conn.has_pending_snapshot(Topic::Products));
}

#[tokio::test]
async fn test_resubscribe_while_snapshot_pending_gets_fresh_snapshot() {
    let release = Arc::new(Semaphore::new(0));
    let hub = hub_with(
        HubConfig::default(),
        RateLimitConfig::default(),
        Arc::new(GatedProvider { release: release.clone() }),
    );
    let (conn, mut rx) = hub.connect();
    next(&mut rx).await;

    hub.handle_text(&conn, r#"{"subscribe": "users"}"#);
    hub.handle_text(&conn, r#"{"unsubscribe": "users"}"#);
    hub.handle_text(&conn, r#"{"subscribe": "users"}"#);
    hub.publish(Topic::Users, json!({ "id": 9 }));

    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Subscribed);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Unsubscribed);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Subscribed);

    release.add_permits(2);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Snapshot);
    let update = next(&mut rx).await;
    assert_eq!(update.kind, EnvelopeKind::Update);
    assert_eq!(update.payload["id"], 9);
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_registry_and_index_stay_consistent() {
    let hub = default_hub();
    let mut connections = Vec::new();
    for _ in 0..8 {
        connections.push(hub.connect());
    }

    for (i, (conn, _)) in connections.iter().enumerate() {
        hub.subscribe(conn, "users").unwrap();
        if i % 2 == 0 {
            hub.subscribe(conn, "all").unwrap();
            hub.unsubscribe(conn, "users").unwrap();
        }
        if i % 3 == 0 {
            hub.disconnect(conn.id, DisconnectReason::ClientClosed);
        }
        assert!(hub.registry().is_consistent());
    }

    for (conn, _) in &connections {
        hub.disconnect(conn.id, DisconnectReason::ClientClosed);
        assert!(hub.registry().is_consistent());
        assert!(!hub.registry().subscribers_of(Topic::Users).contains(&conn.id));
        assert!(!hub.registry().subscribers_of(Topic::All).contains(&conn.id));
    }

    let stats = hub.stats();
    assert_eq!(stats.registry.total_connections, 0);
    assert_eq!(stats.registry.total_subscriptions, 0);
    assert!(stats.registry.topics.is_empty());
}

#[tokio::test]
async fn test_subscribe_idempotent_and_unsubscribe_noop() {
    let hub = default_hub();
    let (conn, mut rx) = hub.connect();
    next(&mut rx).await;

    hub.subscribe(&conn, "orders").unwrap();
    hub.subscribe(&conn, "orders").unwrap();
    assert_eq!(hub.registry().subscribers_of(Topic::Orders).len(), 1);
    assert_eq!(hub.stats().registry.total_subscriptions, 1);

    hub.unsubscribe(&conn, "users").unwrap();
    assert_eq!(hub.registry().subscriptions(conn.id).unwrap().len(), 1);
    assert!(hub.registry().is_consistent());
}

#[tokio::test]
async fn test_rate_limit_rejects_one_and_keeps_connection() {
    let hub = hub_with(
        HubConfig::default(),
        RateLimitConfig {
            enabled: true,
            window_ms: 60_000,
            max_messages: 3,
        },
        Arc::new(MemorySnapshotStore::new(10)),
    );
    let (conn, mut rx) = hub.connect();
    next(&mut rx).await;
    hub.registry().subscribe(conn.id, Topic::Users);

    for i in 0..4 {
        hub.handle_text(&conn, &format!(r#"{{"ping": {i}}}"#));
    }

    let mut echoes = 0;
    let mut rejections = 0;
    for _ in 0..4 {
        let envelope = next(&mut rx).await;
        match envelope.error_reason() {
            Some("RateLimitExceeded") => rejections += 1,
            None if envelope.kind == EnvelopeKind::Heartbeat => echoes += 1,
            other => panic!("unexpected envelope {other:?}"),
        }
    }
    assert_eq!(echoes, 3);
    assert_eq!(rejections, 1);

    assert!(hub.registry().contains(conn.id));
    let report = hub.publish(Topic::Users, json!({ "id": 1 }));
    assert_eq!(report.delivered, 1);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Update);
}

#[tokio::test]
async fn test_silent_connection_evicted_by_running_monitor() {
    let config = HubConfig {
        heartbeat_interval_ms: 100,
        heartbeat_miss_threshold: 3,
        ..HubConfig::default()
    };
    let hub = hub_with(config, RateLimitConfig::default(), Arc::new(MemorySnapshotStore::new(10)));
    let (conn, _rx) = hub.connect();
    hub.subscribe(&conn, "users").unwrap();
    let started = Instant::now();
    tokio::spawn(HeartbeatMonitor::new(hub.clone()).run());

    // Sweeps at 0, 100 and 200 ms: handshake credit, then two misses
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(hub.registry().contains(conn.id), "evicted before the third miss");
    assert_eq!(conn.missed_beats(), 2);

    tokio::time::timeout(Duration::from_secs(2), conn.closed())
        .await
        .expect("evicted on the third miss");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));

    assert!(!hub.registry().contains(conn.id));
    assert!(hub.registry().subscribers_of(Topic::Users).is_empty());
    hub.shutdown();
}

#[tokio::test]
async fn test_failing_subscriber_is_removed() {
    let hub = default_hub();
    let (a, mut rx_a) = hub.connect();
    let (b, mut rx_b) = hub.connect();
    let (c, rx_c) = hub.connect();
    for conn in [&a, &b, &c] {
        hub.registry().subscribe(conn.id, Topic::Orders);
    }
    next(&mut rx_a).await;
    next(&mut rx_b).await;
    drop(rx_c);

    let report = hub.publish(Topic::Orders, json!({ "id": 7 }));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.evicted, vec![c.id]);

    assert_eq!(next(&mut rx_a).await.kind, EnvelopeKind::Update);
    assert_eq!(next(&mut rx_b).await.kind, EnvelopeKind::Update);
    assert!(!hub.registry().contains(c.id));
    assert_eq!(hub.registry().subscribers_of(Topic::Orders).len(), 2);
}

#[tokio::test]
async fn test_wildcard_subscriber_gets_every_topic_once() {
    let hub = default_hub();
    let (conn, mut rx) = hub.connect();
    next(&mut rx).await;
    hub.registry().subscribe(conn.id, Topic::All);
    hub.registry().subscribe(conn.id, Topic::Users);

    let report = hub.publish(Topic::Users, json!({ "id": 1 }));
    assert_eq!(report.delivered, 1);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Update);
    assert_silent(&mut rx).await;
}

#[tokio::test]
async fn test_snapshot_failure_keeps_subscription() {
    let hub = hub_with(HubConfig::default(), RateLimitConfig::default(), Arc::new(FailingProvider));
    let (conn, mut rx) = hub.connect();
    next(&mut rx).await;

    hub.handle_text(&conn, r#"{"subscribe": "users"}"#);
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Subscribed);

    let error = next(&mut rx).await;
    assert_eq!(error.error_reason(), Some("SnapshotFetchFailed"));
    assert_eq!(error.topic, Some(Topic::Users));

    assert!(hub.registry().subscribers_of(Topic::Users).contains(&conn.id));
    hub.publish(Topic::Users, json!({ "id": 2 }));
    assert_eq!(next(&mut rx).await.kind, EnvelopeKind::Update);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let hub = default_hub();
    let (a, _rx_a) = hub.connect();
    let (b, _rx_b) = hub.connect();
    hub.subscribe(&a, "users").unwrap();

    assert_eq!(hub.shutdown(), 2);
    assert_eq!(hub.shutdown(), 0);
    assert!(a.is_closed() && b.is_closed());
    assert_eq!(hub.connection_count(), 0);
    assert!(hub.registry().subscribers_of(Topic::Users).is_empty());
}
