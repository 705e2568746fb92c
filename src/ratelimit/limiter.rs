//! Fixed-window rate limiter keyed by connection

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use crate::connection_manager::ConnectionId;

use super::config::RateLimitConfig;

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Message admitted
    Allowed { count: u32, remaining: u32 },
    /// Over the threshold for the current window
    Rejected { count: u32, retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Window state for one connection
struct WindowEntry {
    window_start: Instant,
    count: u32,
}

/// Tracks `messageWindowStart` / `messageCountInWindow` for every live
/// connection. Entries are sharded so concurrent readers on different
/// connections never contend on a single lock.
pub struct RateLimiter {
    windows: DashMap<ConnectionId, WindowEntry>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one inbound message for `id`
    pub fn admit(&self, id: ConnectionId) -> RateLimitResult {
        self.admit_at(id, Instant::now())
    }

    /// Count one inbound message for `id` as if it arrived at `now`.
    ///
    /// Rejected messages still count toward the window.
    pub fn admit_at(&self, id: ConnectionId, now: Instant) -> RateLimitResult {
        let limit = self.config.max_messages;
        if !self.config.enabled {
            return RateLimitResult::Allowed {
                count: 0,
                remaining: limit,
            };
        }

        let window = self.config.window();
        let mut entry = self.windows.entry(id).or_insert_with(|| WindowEntry {
            window_start: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.window_start) >= window {
            entry.window_start = now;
            entry.count = 1;
        } else {
            entry.count = entry.count.saturating_add(1);
        }

        let count = entry.count;
        if count > limit {
            let elapsed = now.saturating_duration_since(entry.window_start);
            RateLimitResult::Rejected {
                count,
                retry_after: window.saturating_sub(elapsed),
            }
        } else {
            RateLimitResult::Allowed {
                count,
                remaining: limit - count,
            }
        }
    }

    /// Forget the window for a disconnected connection
    pub fn release(&self, id: ConnectionId) {
        self.windows.remove(&id);
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            enabled: self.config.enabled,
            tracked_connections: self.windows.len(),
            window_ms: self.config.window_ms,
            max_messages: self.config.max_messages,
        }
    }
}

/// Statistics about the rate limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub tracked_connections: usize,
    pub window_ms: u64,
    pub max_messages: u32,
}
