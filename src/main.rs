use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;

use realtime_hub::config::Settings;
use realtime_hub::server::{create_app, AppState};
use realtime_hub::shutdown::{wait_for_signal, GracefulShutdown};
use realtime_hub::snapshot::create_snapshot_provider;
use realtime_hub::tasks::HeartbeatMonitor;
use realtime_hub::telemetry::init_telemetry;
use realtime_hub::triggers::RedisChangeFeed;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; keep the guard alive until exit
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state
    let provider = create_snapshot_provider(&settings.snapshot).await;
    let state = AppState::new(settings.clone(), provider);
    let hub = state.hub.clone();
    tracing::info!("Application state initialized");

    let mut shutdown = GracefulShutdown::new(hub.clone());

    // Start heartbeat monitor in background
    let heartbeat = HeartbeatMonitor::new(hub.clone());
    shutdown.track("heartbeat", tokio::spawn(heartbeat.run()));

    // Start Redis change feed in background
    if settings.redis.enabled {
        let feed = Arc::new(RedisChangeFeed::new(settings.redis.clone(), hub.clone()));
        shutdown.track(
            "redis_change_feed",
            tokio::spawn(async move {
                if let Err(e) = feed.start().await {
                    tracing::error!(error = %e, "Redis change feed failed");
                }
            }),
        );
    }

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Close hub connections as soon as the signal arrives so upgraded
    // sockets do not hold up the server
    let signal_hub = hub.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal_hub.shutdown();
        })
        .await?;

    tracing::info!("Waiting for background tasks to finish...");
    shutdown.execute().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
