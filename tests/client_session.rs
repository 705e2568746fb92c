//! Client session driver tests over an in-memory transport.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use realtime_hub::client::{
    BackoffConfig, ClientError, ClientSession, ClientTransport, Connector, SessionAction,
    SessionHandle, SessionState,
};
use realtime_hub::config::ClientConfig;
use realtime_hub::topic::Topic;
use realtime_hub::websocket::ClientMessage;

/// Hub side of one fake transport
struct FakePeer {
    /// Frames the client sent
    from_client: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the client; dropping closes the transport
    to_client: mpsc::UnboundedSender<String>,
}

struct FakeTransport {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl ClientTransport for FakeTransport {
    async fn send(&mut self, text: String) -> Result<(), ClientError> {
        self.outgoing
            .send(text)
            .map_err(|_| ClientError::Transport("peer gone".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ClientError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.incoming.close();
    }
}

struct FakeConnector {
    accepted: mpsc::UnboundedSender<FakePeer>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn ClientTransport>, ClientError> {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(FakePeer { from_client, to_client })
            .map_err(|_| ClientError::Transport("hub gone".to_string()))?;
        Ok(Box::new(FakeTransport {
            outgoing: client_tx,
            incoming: client_rx,
        }))
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval_ms: 60_000,
        reconnect_interval_ms: 20,
        max_reconnect_attempts: 5,
        ..ClientConfig::default()
    }
}

async fn accept(peers: &mut mpsc::UnboundedReceiver<FakePeer>) -> FakePeer {
    tokio::time::timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("connection attempt")
        .expect("connector alive")
}

async fn read_subscribes(peer: &mut FakePeer, count: usize) -> HashSet<String> {
    let mut topics = HashSet::new();
    while topics.len() < count {
        let frame = tokio::time::timeout(Duration::from_secs(2), peer.from_client.recv())
            .await
            .expect("frame from client")
            .expect("client open");
        if let Ok(ClientMessage::Subscribe { subscribe }) = serde_json::from_str(&frame) {
            topics.insert(subscribe);
        }
    }
    topics
}

#[test]
fn test_reconnect_sequence_reissues_subscriptions() {
    let config = config();
    let mut session = ClientSession::with_backoff(
        &config,
        BackoffConfig {
            initial_delay_ms: 20,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        },
    );

    session.connect().unwrap();
    session.on_open(Instant::now()).unwrap();
    session.subscribe(Topic::Users);
    session.subscribe(Topic::Orders);
    assert_eq!(session.state(), SessionState::Connected);

    let actions = session.on_transport_lost().unwrap();
    assert_eq!(session.state(), SessionState::Reconnecting);
    assert_eq!(
        actions,
        vec![
            SessionAction::StopHeartbeat,
            SessionAction::ScheduleReconnect(Duration::from_millis(20))
        ]
    );

    assert_eq!(session.on_backoff_elapsed().unwrap(), vec![SessionAction::Open]);
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(session.retry_count(), 1);

    let actions = session.on_open(Instant::now()).unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.retry_count(), 0);
    assert_eq!(
        actions,
        vec![
            SessionAction::Send(ClientMessage::subscribe(Topic::Users)),
            SessionAction::Send(ClientMessage::subscribe(Topic::Orders)),
            SessionAction::StartHeartbeat,
        ]
    );
    assert!(session.is_loading(Topic::Users));
    assert_eq!(session.stats(Instant::now()).reconnection_count, 1);
}

#[tokio::test]
async fn test_driver_resubscribes_after_transport_drop() {
    let (accepted, mut peers) = mpsc::unbounded_channel();
    let connector = Arc::new(FakeConnector { accepted });
    let (handle, _envelopes) = SessionHandle::spawn(config(), connector);

    let mut first = accept(&mut peers).await;
    handle.subscribe(Topic::Users).await.unwrap();
    handle.subscribe(Topic::Orders).await.unwrap();

    let expected: HashSet<String> = ["users", "orders"].iter().map(|s| s.to_string()).collect();
    assert_eq!(read_subscribes(&mut first, 2).await, expected);

    // Hub drops the connection
    drop(first);

    let mut second = accept(&mut peers).await;
    assert_eq!(read_subscribes(&mut second, 2).await, expected);

    let mut states = handle.state_changes();
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == SessionState::Connected),
    )
    .await
    .expect("connected again")
    .unwrap();

    let status = handle.status();
    assert_eq!(status.desired_topics, vec![Topic::Users, Topic::Orders]);
    assert_eq!(status.stats.reconnection_count, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_driver_answers_probes_and_tracks_snapshots() {
    let (accepted, mut peers) = mpsc::unbounded_channel();
    let connector = Arc::new(FakeConnector { accepted });
    let (handle, mut envelopes) = SessionHandle::spawn(config(), connector);

    let mut peer = accept(&mut peers).await;
    handle.subscribe(Topic::Products).await.unwrap();
    read_subscribes(&mut peer, 1).await;

    peer.to_client
        .send(r#"{"kind":"heartbeat","payload":{"timestamp":123},"sentAt":"2024-01-01T00:00:00Z"}"#.to_string())
        .unwrap();
    let pong = tokio::time::timeout(Duration::from_secs(2), peer.from_client.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        serde_json::from_str::<ClientMessage>(&pong).unwrap(),
        ClientMessage::Pong { pong: 123 }
    );

    peer.to_client
        .send(r#"{"kind":"snapshot","topic":"products","payload":[{"id":1}],"sentAt":"2024-01-01T00:00:00Z"}"#.to_string())
        .unwrap();

    // Envelopes are forwarded in order
    envelopes.recv().await.unwrap();
    let snapshot = envelopes.recv().await.unwrap();
    assert_eq!(snapshot.topic, Some(Topic::Products));

    let deadline = Instant::now() + Duration::from_secs(2);
    while handle.stats().total_messages < 2 {
        assert!(Instant::now() < deadline, "stats not updated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = handle.status();
    assert!(status.loading_topics.is_empty());
    assert_eq!(
        status.snapshots.get(&Topic::Products).map(|v| v.as_ref()),
        Some(&serde_json::json!([{"id": 1}]))
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self) -> Result<Box<dyn ClientTransport>, ClientError> {
            Err(ClientError::Transport("connection refused".to_string()))
        }
    }

    let config = ClientConfig {
        max_reconnect_attempts: 2,
        reconnect_interval_ms: 5,
        ..config()
    };
    let (handle, _envelopes) = SessionHandle::spawn(config, Arc::new(RefusingConnector));

    let mut states = handle.state_changes();
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == SessionState::Error))
        .await
        .expect("error state reached")
        .unwrap();

    handle.shutdown().await;
}

/// Connector whose attempts finish only when the test hands out a permit
struct GatedConnector {
    inner: FakeConnector,
    permits: Arc<Semaphore>,
}

#[async_trait]
impl Connector for GatedConnector {
    async fn connect(&self) -> Result<Box<dyn ClientTransport>, ClientError> {
        let permit = self.permits.acquire().await.map_err(|_| ClientError::Closed)?;
        permit.forget();
        self.inner.connect().await
    }
}

async fn wait_for_state(states: &mut tokio::sync::watch::Receiver<SessionState>, expected: SessionState) {
    tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("state {expected} not reached"))
        .unwrap();
}

#[tokio::test]
async fn test_disconnect_abandons_hanging_connect() {
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(&self) -> Result<Box<dyn ClientTransport>, ClientError> {
            std::future::pending().await
        }
    }

    let (handle, _envelopes) = SessionHandle::spawn(config(), Arc::new(HangingConnector));
    let mut states = handle.state_changes();
    wait_for_state(&mut states, SessionState::Connecting).await;

    handle.disconnect().await.unwrap();
    wait_for_state(&mut states, SessionState::Disconnected).await;

    tokio::time::timeout(Duration::from_millis(500), handle.shutdown())
        .await
        .expect("shutdown does not wait for the connect attempt");
}

#[tokio::test]
async fn test_handle_reports_every_reconnect_state() {
    let (accepted, mut peers) = mpsc::unbounded_channel();
    let permits = Arc::new(Semaphore::new(0));
    let connector = Arc::new(GatedConnector {
        inner: FakeConnector { accepted },
        permits: permits.clone(),
    });
    let (handle, _envelopes) = SessionHandle::spawn(config(), connector);
    let mut states = handle.state_changes();

    wait_for_state(&mut states, SessionState::Connecting).await;
    assert_eq!(handle.state(), SessionState::Connecting);

    permits.add_permits(1);
    let first = accept(&mut peers).await;
    wait_for_state(&mut states, SessionState::Connected).await;

    drop(first);
    wait_for_state(&mut states, SessionState::Reconnecting).await;
    wait_for_state(&mut states, SessionState::Connecting).await;
    assert_eq!(handle.status().stats.reconnection_count, 0);

    permits.add_permits(1);
    let _second = accept(&mut peers).await;
    wait_for_state(&mut states, SessionState::Connected).await;
    assert_eq!(handle.status().stats.reconnection_count, 1);

    handle.shutdown().await;
}
