// Shared foundations
pub mod config;
pub mod error;
pub mod metrics;
pub mod topic;

// Hub core
pub mod broadcast;
pub mod connection_manager;
pub mod hub;
pub mod ratelimit;
pub mod snapshot;

// Application layer
pub mod api;
pub mod server;
pub mod triggers;
pub mod websocket;

// Peer-side session
pub mod client;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
