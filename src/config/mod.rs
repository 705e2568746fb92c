mod settings;

pub use settings::{
    ApiConfig, ClientConfig, HubConfig, OtelConfig, RedisConfig, ServerConfig, Settings,
    SnapshotConfig,
};
