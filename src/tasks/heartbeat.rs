use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::connection_manager::{ConnectionId, DisconnectReason, Liveness};
use crate::error::HubError;
use crate::hub::Hub;
use crate::metrics::HeartbeatMetrics;
use crate::websocket::Envelope;

/// Result of one liveness sweep
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    /// Connections sent a heartbeat probe
    pub probed: usize,
    /// Connections silent this interval but still under the threshold
    pub missed: usize,
    /// Connections removed for exceeding the threshold
    pub evicted: Vec<ConnectionId>,
}

/// Background task that probes every connection each interval and evicts
/// the ones that stay silent for `miss_threshold` consecutive intervals.
pub struct HeartbeatMonitor {
    hub: Arc<Hub>,
    interval: Duration,
    miss_threshold: u32,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatMonitor {
    pub fn new(hub: Arc<Hub>) -> Self {
        let interval = hub.config().heartbeat_interval();
        let miss_threshold = hub.config().heartbeat_miss_threshold;
        let shutdown = hub.shutdown_signal();
        Self {
            hub,
            interval,
            miss_threshold,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            miss_threshold = self.miss_threshold,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat monitor received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep();
                }
            }
        }

        tracing::info!("Heartbeat monitor stopped");
    }

    /// Advance every connection's liveness by one interval
    pub fn sweep(&self) -> SweepReport {
        let start = Instant::now();
        let mut report = SweepReport::default();

        for conn in self.hub.registry().all_connections() {
            match conn.check_liveness(self.miss_threshold) {
                Liveness::Dead(missed) => {
                    tracing::info!(
                        connection_id = %conn.id,
                        missed = missed,
                        "Heartbeat timeout"
                    );
                    let _ = conn.send_envelope(Envelope::error(&HubError::HeartbeatTimeout { missed }));
                    self.hub.disconnect(conn.id, DisconnectReason::HeartbeatTimeout);
                    report.evicted.push(conn.id);
                    continue;
                }
                Liveness::Missed(missed) => {
                    tracing::debug!(connection_id = %conn.id, missed = missed, "Heartbeat missed");
                    report.missed += 1;
                }
                Liveness::Alive => {}
            }

            match conn.send_envelope(Envelope::heartbeat_probe()) {
                Ok(()) => report.probed += 1,
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id, error = %e, "Heartbeat probe failed");
                    self.hub.disconnect(conn.id, DisconnectReason::SlowConsumer);
                    report.evicted.push(conn.id);
                }
            }
        }

        HeartbeatMetrics::record_sweep(start.elapsed(), report.evicted.len());

        if !report.evicted.is_empty() || report.missed > 0 {
            tracing::debug!(
                probed = report.probed,
                missed = report.missed,
                evicted = report.evicted.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Heartbeat sweep completed"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::ratelimit::RateLimitConfig;
    use crate::snapshot::MemorySnapshotStore;
    use crate::topic::Topic;

    fn hub() -> Arc<Hub> {
        Hub::new(
            HubConfig::default(),
            RateLimitConfig::default(),
            Arc::new(MemorySnapshotStore::new(10)),
        )
    }

    #[tokio::test]
    async fn test_silent_connection_evicted_after_threshold() {
        let hub = hub();
        let (conn, _rx) = hub.connect();
        hub.subscribe(&conn, "users").unwrap();
        let monitor = HeartbeatMonitor::new(hub.clone());

        // Handshake counts as traffic for the first interval
        assert_eq!(monitor.sweep().probed, 1);
        assert_eq!(monitor.sweep().missed, 1);

        let report = monitor.sweep();
        assert_eq!(report.evicted, vec![conn.id]);
        assert_eq!(hub.connection_count(), 0);
        assert!(hub.registry().subscribers_of(Topic::Users).is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_survives_one_sweep_short_of_threshold() {
        let hub = Hub::new(
            HubConfig {
                heartbeat_miss_threshold: 3,
                ..HubConfig::default()
            },
            RateLimitConfig::default(),
            Arc::new(MemorySnapshotStore::new(10)),
        );
        let (conn, _rx) = hub.connect();
        let monitor = HeartbeatMonitor::new(hub.clone());

        assert!(monitor.sweep().evicted.is_empty());
        for missed in 1..3 {
            let report = monitor.sweep();
            assert!(report.evicted.is_empty(), "evicted after {missed} misses");
            assert_eq!(conn.missed_beats(), missed);
        }

        assert_eq!(monitor.sweep().evicted, vec![conn.id]);
        assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_inbound_traffic_keeps_connection_alive() {
        let hub = hub();
        let (conn, _rx) = hub.connect();
        let monitor = HeartbeatMonitor::new(hub.clone());

        for _ in 0..5 {
            hub.handle_text(&conn, r#"{"pong": 1}"#);
            let report = monitor.sweep();
            assert!(report.evicted.is_empty());
            assert_eq!(report.missed, 0);
        }
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let hub = hub();
        let handle = tokio::spawn(HeartbeatMonitor::new(hub.clone()).run());

        hub.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor stops")
            .unwrap();
    }
}
