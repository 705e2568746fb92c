use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Coarse link quality from heartbeat round-trip latency and delivered
/// message rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    /// `Good` until a latency sample exists. Each grade needs both a
    /// latency under its bound and a message rate above its floor.
    pub fn assess(latency_ms: Option<u64>, messages_per_second: f64) -> Self {
        let Some(ms) = latency_ms else {
            return ConnectionQuality::Good;
        };
        match (ms, messages_per_second) {
            (ms, rate) if ms < 50 && rate > 0.8 => ConnectionQuality::Excellent,
            (ms, rate) if ms < 100 && rate > 0.6 => ConnectionQuality::Good,
            (ms, rate) if ms < 200 && rate > 0.4 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

/// Point-in-time view of a session's delivery statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub connected_at: Option<DateTime<Utc>>,
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub latency_ms: Option<u64>,
    pub reconnection_count: u32,
    #[serde(with = "duration_millis")]
    pub uptime: Duration,
    pub quality: ConnectionQuality,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            connected_at: None,
            total_messages: 0,
            messages_per_second: 0.0,
            latency_ms: None,
            reconnection_count: 0,
            uptime: Duration::ZERO,
            quality: ConnectionQuality::Good,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Running counters behind [`ConnectionStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    connected_at: Option<(Instant, DateTime<Utc>)>,
    total_messages: u64,
    messages_since_connect: u64,
    latency_ms: Option<u64>,
    reconnection_count: u32,
    ever_connected: bool,
}

impl StatsTracker {
    pub fn on_connected(&mut self, now: Instant) {
        if self.ever_connected {
            self.reconnection_count += 1;
        }
        self.ever_connected = true;
        self.connected_at = Some((now, Utc::now()));
        self.messages_since_connect = 0;
    }

    pub fn on_disconnected(&mut self) {
        self.connected_at = None;
    }

    pub fn record_message(&mut self) {
        self.total_messages += 1;
        self.messages_since_connect += 1;
    }

    pub fn record_latency(&mut self, latency_ms: u64) {
        self.latency_ms = Some(latency_ms);
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionStats {
        let uptime = self
            .connected_at
            .map(|(since, _)| now.saturating_duration_since(since))
            .unwrap_or_default();
        let messages_per_second = self.messages_since_connect as f64 / uptime.as_secs_f64().max(1.0);

        ConnectionStats {
            connected_at: self.connected_at.map(|(_, at)| at),
            total_messages: self.total_messages,
            messages_per_second,
            latency_ms: self.latency_ms,
            reconnection_count: self.reconnection_count,
            uptime,
            quality: ConnectionQuality::assess(self.latency_ms, messages_per_second),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_thresholds() {
        assert_eq!(ConnectionQuality::assess(None, 0.0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::assess(Some(10), 1.0), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::assess(Some(50), 1.0), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::assess(Some(150), 1.0), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::assess(Some(200), 1.0), ConnectionQuality::Poor);
    }

    #[test]
    fn test_quality_drops_with_message_rate() {
        assert_eq!(ConnectionQuality::assess(Some(10), 0.7), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::assess(Some(10), 0.5), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::assess(Some(10), 0.1), ConnectionQuality::Poor);
    }

    #[test]
    fn test_reconnections_counted_after_first_connect() {
        let mut tracker = StatsTracker::default();
        let now = Instant::now();
        tracker.on_connected(now);
        assert_eq!(tracker.snapshot(now).reconnection_count, 0);

        tracker.on_disconnected();
        tracker.on_connected(now);
        tracker.on_disconnected();
        tracker.on_connected(now);
        assert_eq!(tracker.snapshot(now).reconnection_count, 2);
    }

    #[test]
    fn test_message_rate_and_uptime() {
        let mut tracker = StatsTracker::default();
        let start = Instant::now();
        tracker.on_connected(start);
        for _ in 0..10 {
            tracker.record_message();
        }
        tracker.record_latency(42);

        let stats = tracker.snapshot(start + Duration::from_secs(5));
        assert_eq!(stats.total_messages, 10);
        assert_eq!(stats.uptime, Duration::from_secs(5));
        assert!((stats.messages_per_second - 2.0).abs() < f64::EPSILON);
        assert_eq!(stats.quality, ConnectionQuality::Excellent);
        assert!(stats.connected_at.is_some());
    }
}
