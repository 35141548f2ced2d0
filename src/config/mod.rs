mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BrokerSettings, DEFAULT_ERROR_TOPIC, DEFAULT_LOG_LEVEL, DEFAULT_MAX_RECONNECT_RETRIES,
    DEFAULT_RECONNECT_BACKOFF_MS, LoggingSettings, Settings, WorkerSettings, default_queue,
};

pub const DEFAULT_CONFIG_PATH: &str = "config/default";
pub const ENV_PREFIX: &str = "SENSORPIPE";

/// Loads `path` (any format the `config` crate knows, the file is optional)
/// overlaid with `SENSORPIPE_*` environment variables, e.g.
/// `SENSORPIPE_BROKER__HOST`, and merges the result with defaults.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    merge(partial)
}

fn required(value: Option<String>, key: &str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::NotFound(key.to_string()))
}

/// Fills optional keys with defaults and rejects missing required ones.
fn merge(partial: PartialSettings) -> Result<Settings, ConfigError> {
    let broker = partial.broker.unwrap_or_default();
    let worker = partial.worker.unwrap_or_default();
    let logging = partial.logging.unwrap_or_default();

    let host = required(broker.host, "broker.host")?;
    let exchange = required(broker.exchange, "broker.exchange")?;
    let id = required(worker.id, "worker.id")?;

    let mut settings = Settings::new(&host, &exchange, &id);
    if let Some(prefetch) = broker.prefetch {
        settings.broker.prefetch = prefetch;
    }
    if let Some(retries) = broker.max_reconnect_retries {
        settings.broker.max_reconnect_retries = retries;
    }
    if let Some(backoff) = broker.reconnect_backoff_ms {
        settings.broker.reconnect_backoff_ms = backoff;
    }
    if let Some(version) = worker.version {
        settings.worker.version = version;
    }
    if let Some(queue) = worker.queue {
        settings.worker.queue = queue;
    }
    if let Some(error_topic) = worker.error_topic {
        settings.worker.error_topic = error_topic;
    }
    if let Some(level) = logging.level {
        settings.logging.level = level;
    }
    Ok(settings)
}
