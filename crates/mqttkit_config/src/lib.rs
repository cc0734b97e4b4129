//! mqttkit_config
//!
//! Layered configuration for mqttkit clients. Sources, lowest priority first:
//! built-in defaults, `config/default.{toml,yaml,json}`, then `MQTTKIT__*`
//! environment variables (a `.env` file in the working directory is loaded
//! into the environment first). Nested keys use `__`, e.g.
//! `MQTTKIT__BROKER__HOST=broker.local`.

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use tracing::debug;

pub use settings::{
    BrokerSettings, LogSettings, PartialBrokerSettings, PartialLogSettings,
    PartialSessionSettings, PartialSettings, SessionSettings, Settings, WillSettings,
};

pub const ENV_PREFIX: &str = "MQTTKIT";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

fn merge_with_defaults(config: Config) -> Result<Settings, ConfigError> {
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}

/// Loads settings from `config/default` (if present) and the environment,
/// merged over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded environment from {}", path.display());
    }

    let config = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(environment())
        .build()?;

    merge_with_defaults(config)
}

/// Loads settings from an explicit file, which must exist, plus the
/// environment.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let config = Config::builder()
        .add_source(File::from(path.as_ref()))
        .add_source(environment())
        .build()?;

    merge_with_defaults(config)
}
