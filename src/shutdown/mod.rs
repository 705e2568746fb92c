//! Graceful shutdown: wait for a termination signal, close every hub
//! connection, then give background tasks a bounded time to stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::hub::Hub;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for background tasks to stop (default: 10 seconds)
    pub task_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(10),
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

/// Coordinates hub shutdown with the background tasks it feeds
pub struct GracefulShutdown {
    hub: Arc<Hub>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self::with_config(hub, ShutdownConfig::default())
    }

    pub fn with_config(hub: Arc<Hub>, config: ShutdownConfig) -> Self {
        Self {
            hub,
            tasks: Vec::new(),
            config,
        }
    }

    /// Track a background task that stops on the hub's shutdown signal
    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    /// Close every connection, then wait for tracked tasks
    #[tracing::instrument(name = "graceful_shutdown", skip(self), fields(tasks = self.tasks.len()))]
    pub async fn execute(self) -> ShutdownResult {
        let start = Instant::now();
        let mut result = ShutdownResult {
            connections_closed: self.hub.shutdown(),
            ..ShutdownResult::default()
        };

        for (name, handle) in self.tasks {
            match timeout(self.config.task_timeout, handle).await {
                Ok(Ok(())) => result.tasks_stopped += 1,
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "Background task failed");
                    result.tasks_stopped += 1;
                }
                Err(_) => {
                    tracing::warn!(task = name, "Background task did not stop in time");
                    result.tasks_timed_out += 1;
                }
            }
        }

        result.duration = start.elapsed();
        tracing::info!(
            connections_closed = result.connections_closed,
            tasks_stopped = result.tasks_stopped,
            tasks_timed_out = result.tasks_timed_out,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );
        result
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Connections closed by this call; zero if the hub was already shut down
    pub connections_closed: usize,
    pub tasks_stopped: usize,
    pub tasks_timed_out: usize,
    pub duration: Duration,
}
