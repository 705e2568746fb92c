use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// When set, the publish API requires a matching `X-API-Key` header
    pub key: Option<String>,
}

/// Hub runtime parameters
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Interval between heartbeat sweeps in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive silent intervals before a connection is evicted
    #[serde(default = "default_heartbeat_miss_threshold")]
    pub heartbeat_miss_threshold: u32,
    /// Capacity of each connection's outbound buffer
    #[serde(default = "default_outbound_buffer_size")]
    pub outbound_buffer_size: usize,
    /// Maximum records in a snapshot
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,
    /// Pending snapshot requests before new ones fail fast
    #[serde(default = "default_snapshot_queue_size")]
    pub snapshot_queue_size: usize,
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Snapshot backend selection
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_snapshot_backend")]
    pub backend: String,
    /// Records kept per topic by the memory backend
    #[serde(default = "default_snapshot_retention")]
    pub retention: usize,
    pub database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

/// Redis change-feed trigger
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Channels matching `{channel_prefix}:*` are consumed
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Defaults for the bundled client driver
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Sampling ratio between 0.0 and 1.0
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_miss_threshold() -> u32 {
    2
}

fn default_outbound_buffer_size() -> usize {
    64
}

fn default_snapshot_limit() -> usize {
    50
}

fn default_snapshot_queue_size() -> usize {
    1024
}

fn default_snapshot_backend() -> String {
    "memory".to_string()
}

fn default_snapshot_retention() -> usize {
    200
}

fn default_pool_size() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_channel_prefix() -> String {
    "realtime:changes".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_client_endpoint() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "realtime-hub".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("hub.heartbeat_interval_ms", default_heartbeat_interval_ms())?
            .set_default("hub.heartbeat_miss_threshold", default_heartbeat_miss_threshold())?
            .set_default("ratelimit.window_ms", 60_000)?
            .set_default("ratelimit.max_messages", 100)?
            .set_default("snapshot.backend", default_snapshot_backend())?
            .set_default("redis.url", default_redis_url())?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // REALTIME_SERVER__PORT, REALTIME_HUB__SNAPSHOT_LIMIT, REALTIME_API__KEY, etc.
            .add_source(
                Environment::with_prefix("REALTIME")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            hub: HubConfig::default(),
            ratelimit: RateLimitConfig::default(),
            snapshot: SnapshotConfig::default(),
            redis: RedisConfig::default(),
            client: ClientConfig::default(),
            otel: OtelConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_miss_threshold: default_heartbeat_miss_threshold(),
            outbound_buffer_size: default_outbound_buffer_size(),
            snapshot_limit: default_snapshot_limit(),
            snapshot_queue_size: default_snapshot_queue_size(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            backend: default_snapshot_backend(),
            retention: default_snapshot_retention(),
            database_url: None,
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            channel_prefix: default_channel_prefix(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_client_endpoint(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            auto_reconnect: true,
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.hub.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(settings.hub.heartbeat_miss_threshold, 2);
        assert_eq!(settings.hub.outbound_buffer_size, 64);
        assert_eq!(settings.hub.snapshot_limit, 50);
        assert_eq!(settings.ratelimit.window_ms, 60_000);
        assert_eq!(settings.ratelimit.max_messages, 100);
        assert_eq!(settings.client.reconnect_interval_ms, 5_000);
        assert_eq!(settings.client.max_reconnect_attempts, 5);
        assert!(!settings.redis.enabled);
        assert_eq!(settings.snapshot.backend, "memory");
    }

    #[test]
    fn test_sections_deserialize_with_partial_input() {
        let hub: HubConfig = serde_json::from_str(r#"{"snapshot_limit": 10}"#).unwrap();
        assert_eq!(hub.snapshot_limit, 10);
        assert_eq!(hub.heartbeat_miss_threshold, 2);

        let client: ClientConfig = serde_json::from_str(r#"{"auto_reconnect": false}"#).unwrap();
        assert!(!client.auto_reconnect);
        assert_eq!(client.max_reconnect_attempts, 5);
    }
}
