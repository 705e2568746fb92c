use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::hub::Hub;
use crate::snapshot::SnapshotProvider;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub hub: Arc<Hub>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the hub from settings. Must be called inside a tokio runtime.
    pub fn new(settings: Settings, provider: Arc<dyn SnapshotProvider>) -> Self {
        let hub = Hub::new(settings.hub.clone(), settings.ratelimit.clone(), provider);
        Self::with_hub(settings, hub)
    }

    pub fn with_hub(settings: Settings, hub: Arc<Hub>) -> Self {
        Self {
            settings: Arc::new(settings),
            hub,
            start_time: Instant::now(),
        }
    }
}
