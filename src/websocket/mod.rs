//! WebSocket transport: wire messages and the per-connection reader/writer.

mod handler;
mod message;

pub use handler::{handle_socket, ws_handler};
pub use message::{ClientMessage, Envelope, EnvelopeKind, OutboundMessage};
