//! Background tasks.

mod heartbeat;

pub use heartbeat::{HeartbeatMonitor, SweepReport};
