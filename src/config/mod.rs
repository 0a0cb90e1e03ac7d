//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file
//! (`config/default.toml` unless a path is given), then `PUBHUB__`-prefixed
//! environment variables using `__` between sections and keys, for example
//! `PUBHUB__BROKER__MAX_QUEUE_SIZE=250`.

mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConnectionSettings, LoggingSettings, SecuritySettings, ServerSettings,
    Settings, ShutdownSettings,
};

const DEFAULT_CONFIG_FILE: &str = "config/default";
const ENV_PREFIX: &str = "PUBHUB";

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Like [`load_config`], reading `path` instead of the default file. An
/// explicitly named file must exist.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(path) => File::with_name(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };
    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("security.allowed_origins")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available, then merge with defaults
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}
