//! Connection handle and related types

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::topic::Topic;
use crate::websocket::{Envelope, OutboundMessage};

/// Opaque connection identifier, assigned when the handshake completes
pub type ConnectionId = Uuid;

/// Why an enqueue onto a connection's outbound buffer failed
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("outbound buffer full")]
    Full,
}

impl<T> From<mpsc::error::TrySendError<T>> for DeliveryError {
    fn from(err: mpsc::error::TrySendError<T>) -> Self {
        match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        }
    }
}

/// Outcome of one heartbeat check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Traffic seen since the previous check
    Alive,
    /// Silent for this many consecutive intervals, still under threshold
    Missed(u32),
    /// Silent for at least the threshold
    Dead(u32),
}

/// Why a connection left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the socket
    ClientClosed,
    /// Read or write on the transport failed
    TransportError,
    /// Missed too many heartbeat intervals
    HeartbeatTimeout,
    /// Outbound buffer full or closed during delivery
    SlowConsumer,
    /// Hub shutting down
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::SlowConsumer => "slow_consumer",
            DisconnectReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Updates held back while a snapshot for their topic is in flight
#[derive(Debug, Default)]
struct SnapshotGate {
    outstanding: u32,
    /// Outstanding snapshots requested before an unsubscribe; dropped on arrival
    discard: u32,
    held: VecDeque<OutboundMessage>,
}

/// Handle for a single peer session.
///
/// The subscription set lives in the registry next to the index so both are
/// updated under one lock; this handle carries the outbound channel and the
/// liveness counters.
pub struct Connection {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    /// Unix millis of the last inbound frame
    last_heartbeat_at: AtomicI64,
    seen_since_check: AtomicBool,
    missed_beats: AtomicU32,
    messages_received: AtomicU64,
    gates: Mutex<HashMap<Topic, SnapshotGate>>,
    max_held: usize,
    closed: AtomicBool,
    close_reason: OnceLock<DisconnectReason>,
    close_signal: Notify,
}

impl Connection {
    pub fn new(sender: mpsc::Sender<OutboundMessage>) -> Self {
        let now = Utc::now();
        let max_held = sender.max_capacity();
        Self {
            id: Uuid::new_v4(),
            connected_at: now,
            sender,
            last_heartbeat_at: AtomicI64::new(now.timestamp_millis()),
            // The handshake itself counts as traffic
            seen_since_check: AtomicBool::new(true),
            missed_beats: AtomicU32::new(0),
            messages_received: AtomicU64::new(0),
            gates: Mutex::new(HashMap::new()),
            max_held,
            closed: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            close_signal: Notify::new(),
        }
    }

    /// Record proof of liveness (any inbound frame)
    pub fn record_activity(&self) {
        self.last_heartbeat_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        self.seen_since_check.store(true, Ordering::Release);
    }

    /// Count an inbound application message, returning the running total
    pub fn record_inbound(&self) -> u64 {
        self.messages_received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_heartbeat_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_heartbeat_at.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn missed_beats(&self) -> u32 {
        self.missed_beats.load(Ordering::Relaxed)
    }

    /// Advance the liveness state by one heartbeat interval
    pub fn check_liveness(&self, miss_threshold: u32) -> Liveness {
        if self.seen_since_check.swap(false, Ordering::AcqRel) {
            self.missed_beats.store(0, Ordering::Relaxed);
            return Liveness::Alive;
        }

        let missed = self.missed_beats.fetch_add(1, Ordering::Relaxed) + 1;
        if missed >= miss_threshold.max(1) {
            Liveness::Dead(missed)
        } else {
            Liveness::Missed(missed)
        }
    }

    /// Enqueue without waiting; a full buffer is a delivery failure
    pub fn try_send(&self, message: OutboundMessage) -> Result<(), DeliveryError> {
        self.sender.try_send(message).map_err(DeliveryError::from)
    }

    pub fn send_envelope(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.try_send(OutboundMessage::envelope(envelope))
    }

    /// Hold `topic` updates until the matching snapshot has been queued
    pub fn hold_for_snapshot(&self, topic: Topic) {
        let mut gates = self.lock_gates();
        gates.entry(topic).or_default().outstanding += 1;
    }

    /// Deliver a topic-scoped message, respecting any pending snapshot
    pub fn deliver(&self, topic: Topic, message: OutboundMessage) -> Result<(), DeliveryError> {
        let mut gates = self.lock_gates();
        if let Some(gate) = gates.get_mut(&topic) {
            if gate.held.len() >= self.max_held {
                gate.held.pop_front();
            }
            gate.held.push_back(message);
            return Ok(());
        }
        self.try_send(message)
    }

    /// Queue a snapshot (or the error replacing it) and release held updates
    /// once no other snapshot for the topic is outstanding.
    pub fn complete_snapshot(&self, topic: Topic, envelope: Envelope) -> Result<(), DeliveryError> {
        let mut gates = self.lock_gates();

        let stale = gates.get(&topic).is_some_and(|gate| gate.discard > 0);
        let mut result = if stale {
            Ok(())
        } else {
            self.send_envelope(envelope)
        };

        let release = match gates.get_mut(&topic) {
            Some(gate) => {
                gate.outstanding = gate.outstanding.saturating_sub(1);
                if stale {
                    gate.discard -= 1;
                }
                gate.outstanding == 0
            }
            None => false,
        };

        if release {
            if let Some(gate) = gates.remove(&topic) {
                for message in gate.held {
                    if let Err(e) = self.try_send(message) {
                        result = result.and(Err(e));
                        break;
                    }
                }
            }
        }

        result
    }

    /// Give up one outstanding snapshot for `topic` without sending it.
    /// Held updates are discarded once no snapshot remains outstanding.
    pub fn cancel_snapshot(&self, topic: Topic) {
        let mut gates = self.lock_gates();
        if let Some(gate) = gates.get_mut(&topic) {
            gate.outstanding = gate.outstanding.saturating_sub(1);
            gate.discard = gate.discard.saturating_sub(1);
            if gate.outstanding == 0 {
                gates.remove(&topic);
            }
        }
    }

    /// The peer left `topic`: drop held updates, and drop every snapshot
    /// still outstanding for it when it arrives.
    pub fn discard_pending(&self, topic: Topic) {
        let mut gates = self.lock_gates();
        if let Some(gate) = gates.get_mut(&topic) {
            gate.discard = gate.outstanding;
            gate.held.clear();
        }
    }

    pub fn has_pending_snapshot(&self, topic: Topic) -> bool {
        self.lock_gates().contains_key(&topic)
    }

    /// Best-effort close: ask the writer to send a close frame and wake
    /// whoever is waiting on [`Connection::closed`]. Idempotent.
    pub fn close(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_reason.set(reason);
        let _ = self
            .sender
            .try_send(OutboundMessage::Close(Some(reason.as_str().to_string())));
        self.close_signal.notify_one();
    }

    /// Reason passed to the first [`Connection::close`] call
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.get().copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// Resolves once [`Connection::close`] has been called
    pub async fn closed(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.close_signal.notified().await;
    }

    fn lock_gates(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, SnapshotGate>> {
        self.gates
            .lock()
            .expect("snapshot gate lock poisoned")
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected_at", &self.connected_at)
            .field("missed_beats", &self.missed_beats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::EnvelopeKind;
    use serde_json::json;

    fn next_kind(rx: &mut mpsc::Receiver<OutboundMessage>) -> Option<EnvelopeKind> {
        rx.try_recv().ok().and_then(|m| m.decode()).map(|e| e.kind)
    }

    #[test]
    fn test_liveness_counts_consecutive_misses() {
        let (tx, _rx) = mpsc::channel(4);
        let conn = Connection::new(tx);

        assert_eq!(conn.check_liveness(2), Liveness::Alive);
        assert_eq!(conn.check_liveness(2), Liveness::Missed(1));
        conn.record_activity();
        assert_eq!(conn.check_liveness(2), Liveness::Alive);
        assert_eq!(conn.check_liveness(2), Liveness::Missed(1));
        assert_eq!(conn.check_liveness(2), Liveness::Dead(2));
    }

    #[test]
    fn test_full_buffer_is_delivery_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(tx);

        assert!(conn.send_envelope(Envelope::heartbeat_probe()).is_ok());
        assert_eq!(
            conn.send_envelope(Envelope::heartbeat_probe()),
            Err(DeliveryError::Full)
        );
    }

    #[test]
    fn test_closed_receiver_is_delivery_failure() {
        let (tx, rx) = mpsc::channel(4);
        let conn = Connection::new(tx);
        drop(rx);

        assert_eq!(
            conn.send_envelope(Envelope::heartbeat_probe()),
            Err(DeliveryError::Closed)
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn test_updates_wait_for_pending_snapshot() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(tx);

        conn.hold_for_snapshot(Topic::Products);
        conn.deliver(
            Topic::Products,
            OutboundMessage::envelope(Envelope::update(Topic::Products, json!({"id": 1}))),
        )
        .unwrap();
        conn.deliver(
            Topic::Orders,
            OutboundMessage::envelope(Envelope::update(Topic::Orders, json!({"id": 2}))),
        )
        .unwrap();

        // Orders is not gated, products is
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Update));
        assert!(rx.try_recv().is_err());

        conn.complete_snapshot(Topic::Products, Envelope::snapshot(Topic::Products, vec![]))
            .unwrap();
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Snapshot));
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Update));
        assert!(!conn.has_pending_snapshot(Topic::Products));
    }

    #[test]
    fn test_gate_stays_closed_until_last_snapshot() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(tx);

        conn.hold_for_snapshot(Topic::Users);
        conn.hold_for_snapshot(Topic::Users);
        conn.deliver(
            Topic::Users,
            OutboundMessage::envelope(Envelope::update(Topic::Users, json!({}))),
        )
        .unwrap();

        conn.complete_snapshot(Topic::Users, Envelope::snapshot(Topic::Users, vec![]))
            .unwrap();
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Snapshot));
        assert!(rx.try_recv().is_err());

        conn.complete_snapshot(Topic::Users, Envelope::snapshot(Topic::Users, vec![]))
            .unwrap();
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Snapshot));
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Update));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_signals() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = Connection::new(tx);

        conn.close(DisconnectReason::HeartbeatTimeout);
        conn.close(DisconnectReason::Shutdown);
        conn.closed().await;

        assert!(matches!(rx.try_recv(), Ok(OutboundMessage::Close(Some(r))) if r == "heartbeat_timeout"));
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));
    }

    #[test]
    fn test_discarded_snapshot_and_updates_are_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(tx);

        conn.hold_for_snapshot(Topic::Products);
        conn.deliver(
            Topic::Products,
            OutboundMessage::envelope(Envelope::update(Topic::Products, json!({"id": 1}))),
        )
        .unwrap();
        conn.discard_pending(Topic::Products);

        conn.complete_snapshot(Topic::Products, Envelope::snapshot(Topic::Products, vec![]))
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(!conn.has_pending_snapshot(Topic::Products));
    }

    #[test]
    fn test_resubscribe_after_discard_delivers_fresh_snapshot() {
        let (tx, mut rx) = mpsc::channel(8);
        let conn = Connection::new(tx);

        conn.hold_for_snapshot(Topic::Users);
        conn.discard_pending(Topic::Users);
        conn.hold_for_snapshot(Topic::Users);
        conn.deliver(
            Topic::Users,
            OutboundMessage::envelope(Envelope::update(Topic::Users, json!({"id": 2}))),
        )
        .unwrap();

        // First arrival is the stale one
        conn.complete_snapshot(Topic::Users, Envelope::snapshot(Topic::Users, vec![]))
            .unwrap();
        assert!(rx.try_recv().is_err());

        conn.complete_snapshot(Topic::Users, Envelope::snapshot(Topic::Users, vec![]))
            .unwrap();
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Snapshot));
        assert_eq!(next_kind(&mut rx), Some(EnvelopeKind::Update));
    }
}
