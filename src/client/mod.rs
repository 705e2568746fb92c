//! Peer-side session: a sans-IO state machine plus a tokio driver that runs
//! it over a WebSocket.

mod backoff;
mod driver;
mod session;
mod state;
mod stats;
mod transport;

use thiserror::Error;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use driver::{SessionHandle, SessionStatus};
pub use session::{ClientSession, SessionAction};
pub use state::{transition, ReconnectPolicy, SessionEvent, SessionState};
pub use stats::{ConnectionQuality, ConnectionStats};
pub use transport::{ClientTransport, Connector, WsConnector};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Illegal transition from {from} on {event:?}")]
    InvalidTransition { from: SessionState, event: SessionEvent },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Session driver has stopped")]
    Closed,
}
