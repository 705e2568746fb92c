use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::ClientConfig;
use crate::topic::Topic;
use crate::websocket::{ClientMessage, Envelope, EnvelopeKind};

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::state::{transition, ReconnectPolicy, SessionEvent, SessionState};
use super::stats::{ConnectionStats, StatsTracker};
use super::ClientError;

/// Side effect requested by the session; the driver performs it
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Open a new transport
    Open,
    /// Close the current transport
    Close,
    Send(ClientMessage),
    ScheduleReconnect(Duration),
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
}

/// Peer-side session state machine.
///
/// Holds no I/O: every input returns the actions the caller must perform.
/// Desired topics survive reconnects and are re-sent on every handshake.
#[derive(Debug)]
pub struct ClientSession {
    state: SessionState,
    auto_reconnect: bool,
    max_retries: u32,
    retry_count: u32,
    backoff: ExponentialBackoff,
    desired: BTreeSet<Topic>,
    loading: BTreeSet<Topic>,
    /// Latest snapshot payload per concrete topic
    data: BTreeMap<Topic, Arc<Value>>,
    stats: StatsTracker,
}

impl ClientSession {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_backoff(config, BackoffConfig::from_client(config))
    }

    pub fn with_backoff(config: &ClientConfig, backoff: BackoffConfig) -> Self {
        Self {
            state: SessionState::Disconnected,
            auto_reconnect: config.auto_reconnect,
            max_retries: config.max_reconnect_attempts,
            retry_count: 0,
            backoff: ExponentialBackoff::new(backoff),
            desired: BTreeSet::new(),
            loading: BTreeSet::new(),
            data: BTreeMap::new(),
            stats: StatsTracker::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn desired_topics(&self) -> Vec<Topic> {
        self.desired.iter().copied().collect()
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.desired.contains(&topic)
    }

    /// Whether `topic` is still waiting for its snapshot. `all` is loading
    /// while any concrete topic is.
    pub fn is_loading(&self, topic: Topic) -> bool {
        topic.expand().iter().any(|t| self.loading.contains(t))
    }

    pub fn loading_topics(&self) -> Vec<Topic> {
        self.loading.iter().copied().collect()
    }

    /// Most recent snapshot received for `topic`
    pub fn snapshot_data(&self, topic: Topic) -> Option<Arc<Value>> {
        self.data.get(&topic).cloned()
    }

    pub fn snapshots(&self) -> BTreeMap<Topic, Arc<Value>> {
        self.data.clone()
    }

    pub fn stats(&self, now: Instant) -> ConnectionStats {
        self.stats.snapshot(now)
    }

    fn apply(&mut self, event: SessionEvent) -> Result<SessionState, ClientError> {
        let policy = ReconnectPolicy {
            auto_reconnect: self.auto_reconnect,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
        };
        let next = transition(self.state, event, policy)?;
        tracing::debug!(from = %self.state, to = %next, event = ?event, "Session transition");
        self.state = next;
        Ok(next)
    }

    pub fn connect(&mut self) -> Result<Vec<SessionAction>, ClientError> {
        self.apply(SessionEvent::ConnectRequested)?;
        Ok(vec![SessionAction::Open])
    }

    /// Handshake succeeded: resubscribe every desired topic
    pub fn on_open(&mut self, now: Instant) -> Result<Vec<SessionAction>, ClientError> {
        self.apply(SessionEvent::HandshakeSucceeded)?;
        self.retry_count = 0;
        self.backoff.reset();
        self.stats.on_connected(now);
        self.mark_all_loading();

        let mut actions: Vec<SessionAction> = self
            .desired
            .iter()
            .map(|t| SessionAction::Send(ClientMessage::subscribe(*t)))
            .collect();
        actions.push(SessionAction::StartHeartbeat);
        Ok(actions)
    }

    /// Transport closed or failed while connecting or connected
    pub fn on_transport_lost(&mut self) -> Result<Vec<SessionAction>, ClientError> {
        let next = self.apply(SessionEvent::TransportLost)?;
        self.stats.on_disconnected();
        self.mark_all_loading();

        let mut actions = vec![SessionAction::StopHeartbeat];
        match next {
            SessionState::Reconnecting => {
                let delay = self.backoff.next_delay();
                tracing::info!(
                    retry = self.retry_count + 1,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                actions.push(SessionAction::ScheduleReconnect(delay));
            }
            SessionState::Error => {
                tracing::warn!(retries = self.retry_count, "Reconnect attempts exhausted");
            }
            _ => {}
        }
        Ok(actions)
    }

    pub fn on_backoff_elapsed(&mut self) -> Result<Vec<SessionAction>, ClientError> {
        self.apply(SessionEvent::BackoffElapsed)?;
        self.retry_count += 1;
        Ok(vec![SessionAction::Open])
    }

    /// Explicit disconnect; legal from any state
    pub fn disconnect(&mut self) -> Vec<SessionAction> {
        let was = self.state;
        // DisconnectRequested is accepted in every state
        let _ = self.apply(SessionEvent::DisconnectRequested);
        self.retry_count = 0;
        self.backoff.reset();
        self.stats.on_disconnected();

        let mut actions = vec![SessionAction::CancelReconnect, SessionAction::StopHeartbeat];
        if matches!(was, SessionState::Connecting | SessionState::Connected) {
            actions.push(SessionAction::Close);
        }
        actions
    }

    pub fn subscribe(&mut self, topic: Topic) -> Vec<SessionAction> {
        self.desired.insert(topic);
        self.loading.extend(topic.expand());

        if self.state == SessionState::Connected {
            vec![SessionAction::Send(ClientMessage::subscribe(topic))]
        } else {
            Vec::new()
        }
    }

    pub fn unsubscribe(&mut self, topic: Topic) -> Vec<SessionAction> {
        self.desired.remove(&topic);
        let still_covered: BTreeSet<Topic> = self.desired.iter().flat_map(|t| t.expand()).collect();
        self.loading.retain(|t| still_covered.contains(t));
        self.data.retain(|t, _| still_covered.contains(t));

        if self.state == SessionState::Connected {
            vec![SessionAction::Send(ClientMessage::unsubscribe(topic))]
        } else {
            Vec::new()
        }
    }

    /// Account for a received envelope. Hub heartbeat probes are answered
    /// with a `pong`; echoes of our own pings yield a latency sample.
    pub fn on_envelope(&mut self, envelope: &Envelope, now_ms: i64) -> Vec<SessionAction> {
        self.stats.record_message();

        match envelope.kind {
            EnvelopeKind::Snapshot => {
                if let Some(topic) = envelope.topic {
                    self.loading.remove(&topic);
                    if self.desired.iter().any(|t| t.expand().contains(&topic)) {
                        self.data.insert(topic, Arc::new(envelope.payload.clone()));
                    }
                }
            }
            EnvelopeKind::Heartbeat => {
                if let Some(echo) = envelope.echo_timestamp() {
                    self.stats.record_latency(now_ms.saturating_sub(echo).max(0) as u64);
                } else if let Some(probe) = envelope.probe_timestamp() {
                    return vec![SessionAction::Send(ClientMessage::Pong { pong: probe })];
                }
            }
            EnvelopeKind::Error => {
                tracing::warn!(
                    reason = envelope.error_reason().unwrap_or("unknown"),
                    "Hub reported an error"
                );
                if let Some(topic) = envelope.topic {
                    // A failed snapshot will not arrive
                    self.loading.remove(&topic);
                }
            }
            _ => {}
        }
        Vec::new()
    }

    /// Local heartbeat tick: send a latency probe when connected
    pub fn heartbeat_tick(&self, now_ms: i64) -> Option<SessionAction> {
        (self.state == SessionState::Connected).then_some(SessionAction::Send(ClientMessage::Ping { ping: now_ms }))
    }

    fn mark_all_loading(&mut self) {
        self.loading = self.desired.iter().flat_map(|t| t.expand()).collect();
    }
}
