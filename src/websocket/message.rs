use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::HubError;
use crate::topic::Topic;

/// Messages sent from client to hub
///
/// Frames are plain JSON objects keyed by the directive name, e.g.
/// `{"subscribe": "products"}`. Topic names stay as strings here so an
/// unknown topic is reported as `InvalidTopic` rather than a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Subscribe { subscribe: String },
    Unsubscribe { unsubscribe: String },
    /// Client latency probe; answered with a `heartbeat` echo
    Ping { ping: i64 },
    /// Acknowledgment of a hub heartbeat probe
    Pong { pong: i64 },
}

impl ClientMessage {
    pub fn subscribe(topic: Topic) -> Self {
        Self::Subscribe {
            subscribe: topic.as_str().to_string(),
        }
    }

    pub fn unsubscribe(topic: Topic) -> Self {
        Self::Unsubscribe {
            unsubscribe: topic.as_str().to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::Unsubscribe { .. } => "unsubscribe",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
        }
    }
}

/// Envelope discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Connected,
    Subscribed,
    Unsubscribed,
    Snapshot,
    Update,
    Heartbeat,
    Error,
}

/// Messages sent from hub to client.
///
/// Envelopes are never mutated once built; fan-out shares one instance (or
/// its serialized form) across every recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    #[serde(default)]
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    fn new(kind: EnvelopeKind, topic: Option<Topic>, payload: Value) -> Self {
        Self {
            kind,
            topic,
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn connected(connection_id: Uuid) -> Self {
        Self::new(
            EnvelopeKind::Connected,
            None,
            json!({ "connectionId": connection_id }),
        )
    }

    pub fn subscribed(topic: Topic) -> Self {
        Self::new(
            EnvelopeKind::Subscribed,
            Some(topic),
            json!({ "subscription": topic }),
        )
    }

    pub fn unsubscribed(topic: Topic) -> Self {
        Self::new(
            EnvelopeKind::Unsubscribed,
            Some(topic),
            json!({ "subscription": topic }),
        )
    }

    pub fn snapshot(topic: Topic, records: Vec<Value>) -> Self {
        Self::new(EnvelopeKind::Snapshot, Some(topic), Value::Array(records))
    }

    pub fn update(topic: Topic, payload: Value) -> Self {
        Self::new(EnvelopeKind::Update, Some(topic), payload)
    }

    /// Hub-initiated liveness probe
    pub fn heartbeat_probe() -> Self {
        Self::new(
            EnvelopeKind::Heartbeat,
            None,
            json!({ "timestamp": Utc::now().timestamp_millis() }),
        )
    }

    /// Reply to a client `ping`, echoing its timestamp
    pub fn heartbeat_echo(echo: i64) -> Self {
        Self::new(EnvelopeKind::Heartbeat, None, json!({ "echo": echo }))
    }

    pub fn error(error: &HubError) -> Self {
        let topic = match error {
            HubError::SnapshotFetchFailed { topic, .. } => Some(*topic),
            _ => None,
        };
        Self::new(
            EnvelopeKind::Error,
            topic,
            json!({ "message": error.to_string(), "reason": error.reason() }),
        )
    }

    /// Reason code of an `error` envelope
    pub fn error_reason(&self) -> Option<&str> {
        if self.kind != EnvelopeKind::Error {
            return None;
        }
        self.payload.get("reason").and_then(Value::as_str)
    }

    /// Probe timestamp of a hub heartbeat, `None` for echoes
    pub fn probe_timestamp(&self) -> Option<i64> {
        if self.kind != EnvelopeKind::Heartbeat {
            return None;
        }
        self.payload.get("timestamp").and_then(Value::as_i64)
    }

    /// Echoed client timestamp of a heartbeat reply
    pub fn echo_timestamp(&self) -> Option<i64> {
        if self.kind != EnvelopeKind::Heartbeat {
            return None;
        }
        self.payload.get("echo").and_then(Value::as_i64)
    }
}

/// Item queued on a connection's outbound buffer
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Envelope(Arc<Envelope>),
    /// Envelope serialized once and shared across a fan-out
    Serialized(Arc<str>),
    /// Ask the writer to send a close frame and stop
    Close(Option<String>),
}

impl OutboundMessage {
    pub fn envelope(envelope: Envelope) -> Self {
        Self::Envelope(Arc::new(envelope))
    }

    /// Serialize once for delivery to many connections
    pub fn preserialize(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(envelope)?;
        Ok(Self::Serialized(Arc::from(json)))
    }

    /// JSON text for the wire, `None` for control items
    pub fn to_json(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            OutboundMessage::Envelope(envelope) => serde_json::to_string(envelope.as_ref()).map(Some),
            OutboundMessage::Serialized(json) => Ok(Some(json.to_string())),
            OutboundMessage::Close(_) => Ok(None),
        }
    }

    /// Decoded envelope, whichever form it was queued in
    pub fn decode(&self) -> Option<Envelope> {
        match self {
            OutboundMessage::Envelope(envelope) => Some(envelope.as_ref().clone()),
            OutboundMessage::Serialized(json) => serde_json::from_str(json).ok(),
            OutboundMessage::Close(_) => None,
        }
    }
}
