//! Rate limiting configuration

use std::time::Duration;

use serde::Deserialize;

/// Per-connection inbound message limits
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Whether inbound messages are throttled at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fixed window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Messages admitted per window; message `max_messages + 1` is rejected
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_messages() -> u32 {
    100
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_ms: default_window_ms(),
            max_messages: default_max_messages(),
        }
    }
}
