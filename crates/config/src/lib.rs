mod env_parsing;
mod loader;
mod schema;

pub use self::loader::{load_from_env_or_default, load_from_path};
pub use self::schema::{
    AlertsConfig, AppConfig, BackpressureConfig, DeltaLogConfig, DetectionConfig, EnrichmentConfig,
    SinkConfig, StreamConfig, SystemConfig,
};

/// Durable stream key and consumer group shared by every process role.
pub const TX_STREAM_KEY: &str = "stream:tx";
pub const CONSUMER_GROUP: &str = "parsers";
pub const CONFIG_RELOAD_CHANNEL: &str = "cfg:reload";

#[cfg(test)]
mod tests;
