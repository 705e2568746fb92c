use std::fmt;

use serde::Serialize;

use super::ClientError;

/// Peer-side connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that move a session between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    HandshakeSucceeded,
    TransportLost,
    BackoffElapsed,
    DisconnectRequested,
}

/// Reconnect budget consulted when the transport is lost
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub auto_reconnect: bool,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Next state for `event`, or `InvalidTransition` when the event is not
/// legal in `from`.
pub fn transition(
    from: SessionState,
    event: SessionEvent,
    policy: ReconnectPolicy,
) -> Result<SessionState, ClientError> {
    use SessionEvent::*;
    use SessionState::*;

    let next = match (from, event) {
        (_, DisconnectRequested) => Disconnected,
        (Disconnected, ConnectRequested) => Connecting,
        (Connecting, HandshakeSucceeded) => Connected,
        (Connecting | Connected, TransportLost) => {
            if !policy.auto_reconnect {
                Disconnected
            } else if policy.retry_count < policy.max_retries {
                Reconnecting
            } else {
                Error
            }
        }
        (Reconnecting, BackoffElapsed) => Connecting,
        (from, event) => return Err(ClientError::InvalidTransition { from, event }),
    };

    Ok(next)
}
