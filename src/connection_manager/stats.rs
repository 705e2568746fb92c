//! Registry statistics and info structures

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::ConnectionId;

/// Registry statistics
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub total_subscriptions: usize,
    /// topic name -> subscriber count, only topics with subscribers
    pub topics: BTreeMap<String, usize>,
}

/// Per-connection listing exposed on the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub subscriptions: Vec<String>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub message_count: u64,
    pub missed_beats: u32,
}
