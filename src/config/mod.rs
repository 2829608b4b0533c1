//! Application configuration.
//!
//! Two sources feed the process: the device identity, which comes from
//! environment variables (see [`identity`]), and an optional TOML file with
//! tuning for every other component. Each file section derives `Validate`
//! and falls back to defaults when absent.
//!
//! Both are loaded once at startup and never change afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{
    downstream::{ConsumerConfig, HandlerConfig},
    identity::DeviceIdentity,
    logger::LoggerConfig,
    telemetry::TelemetryConfig,
    transport::{ShutdownConfig, TransportConfig},
};

pub mod downstream;
pub mod identity;
pub mod logger;
pub mod telemetry;
pub mod transport;

/// Timestamped console output for the window before the tracing subscriber
/// is installed.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Current UTC time for the `print_*` macros. Empty if formatting fails.
#[doc(hidden)]
pub fn timestamp() -> String {
    time::format_description::parse(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z",
    )
    .ok()
    .and_then(|format| time::OffsetDateTime::now_utc().format(&format).ok())
    .unwrap_or_default()
}

/// Errors raised while assembling the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required environment variables that are unset or blank, all of them.
    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingVariable(Vec<&'static str>),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Contents of the TOML configuration file.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    pub transport: TransportConfig,

    #[validate(nested)]
    pub shutdown: ShutdownConfig,

    #[validate(nested)]
    pub handler: HandlerConfig,

    #[validate(nested)]
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Loads the configuration file, or returns defaults when there is none.
    ///
    /// Lookup order:
    /// 1. `TEMPSIM_CONFIG` environment variable
    /// 2. `/etc/tempsim/config.toml`
    ///
    /// A path named by `TEMPSIM_CONFIG` must exist.
    pub fn new() -> Result<Self, ConfigError> {
        match Self::get_config_path() {
            Some(path) => Self::load(&path),
            None => {
                print_info!("No configuration file found, using defaults");
                let config = Config::default();
                config
                    .validate()
                    .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
                Ok(config)
            }
        }
    }

    fn get_config_path() -> Option<PathBuf> {
        if let Ok(config_path) = std::env::var("TEMPSIM_CONFIG") {
            let path = PathBuf::from(config_path);
            print_info!("Using config from TEMPSIM_CONFIG: {}", path.display());
            return Some(path);
        }

        let fallback = Path::new("/etc/tempsim/config.toml");
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Some(fallback.to_path_buf());
        }

        None
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Connection settings for `identity`, ready for `MqttManager`.
    pub fn transport_for(&self, identity: &DeviceIdentity) -> tempsim_mqtt::Config {
        self.transport.for_identity(identity)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::{telemetry::TickMode, *};

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let file = write_config(
            r#"
            [telemetry]
            interval_ms = 1000
            tick_mode = "serialized"

            [shutdown]
            stop_timeout_ms = 2000
            "#,
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.telemetry.interval_ms, 1000);
        assert_eq!(config.telemetry.tick_mode, TickMode::Serialized);
        assert_eq!(config.telemetry.topic, "device/temperature");
        assert_eq!(config.shutdown.stop_timeout_ms, 2000);
        assert_eq!(config.transport.keep_alive, 1200);
        assert_eq!(config.handler.alert_threshold, 27);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/tempsim.toml"));
        assert!(matches!(result, Err(ConfigError::Config(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = write_config("[telemetry\ninterval_ms = ");
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_rejects_invalid_section() {
        let file = write_config(
            r#"
            [telemetry]
            temperature_min = 40
            temperature_max = 20
            "#,
        );
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_variable_lists_all_names() {
        let err = ConfigError::MissingVariable(vec!["HOST", "CLIENT_ID"]);
        assert_eq!(
            err.to_string(),
            "Missing required environment variables: HOST, CLIENT_ID"
        );
    }
}
