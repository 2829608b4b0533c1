//! Connection settings for the broker link.
//!
//! The device always talks to its broker over mutual TLS, so unlike a
//! general-purpose client there is no plain TCP mode: `tls` is mandatory and
//! must name a CA bundle, a client certificate and its private key.
//!
//! Every struct derives `Validate`; `ClientBuilder::from_config` runs the
//! checks before any client object is constructed, so a bad field fails at
//! startup and never at connect time.
//!
//! # Examples
//!
//! ```ignore
//! let config = Config {
//!     host: "abc123-ats.iot.eu-west-1.amazonaws.com".into(),
//!     client_id: "dev-1".into(),
//!     tls: TlsConfig::new("/certs/root-CA.crt", "/certs/dev.cert.pem", "/certs/dev.private.key"),
//!     ..Default::default()
//! };
//! ```

use std::path::Path;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::error::TransferError;

/// Default MQTT-over-TLS port.
pub const DEFAULT_PORT: u16 = 8883;

/// Keep-alive the device negotiates with its broker, in seconds.
pub const DEFAULT_KEEP_ALIVE: u64 = 1200;

/// Main broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker hostname or IP address.
    ///
    /// DNS resolution happens at connection time, not validation time.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port, 8883 unless overridden.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Client identifier presented in CONNECT.
    ///
    /// Managed brokers tie this to the certificate policy, so it is never
    /// generated locally.
    #[validate(length(
        min = 1,
        max = 128,
        message = "Client ID must be between 1 and 128 characters"
    ))]
    pub client_id: String,

    /// Keep-alive interval in seconds.
    ///
    /// The client pings the broker when idle for this long. Defaults to 1200,
    /// which the broker accepts as its upper bound.
    ///
    /// ```toml
    /// keep_alive = 1200
    /// ```
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// TCP connect plus TLS handshake timeout, in seconds.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Whether to request a clean session from the broker.
    pub clean_session: bool,

    /// Maximum number of QoS 1/2 publishes awaiting acknowledgement.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Maximum MQTT packet size in bytes, applied to both directions.
    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Number of requests the client can queue before `publish` waits.
    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: Option<u8>,

    /// Pause, in seconds, after a failed poll before the link is polled again.
    ///
    /// This is a fixed delay. The underlying client reconnects on the next
    /// poll; there is no growth or attempt limit.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Mutual TLS material.
    #[validate(nested)]
    pub tls: TlsConfig,
}

impl Default for Config {
    /// Defaults suitable for tests; `host`, `client_id` and `tls` must be
    /// filled in before connecting anywhere real.
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: "tempsim".to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            connection_timeout: 30,
            clean_session: true,
            max_inflight: 100,
            max_packet_size: Some(65_535),
            request_channel_capacity: Some(10),
            reconnect_delay: 5,
            tls: TlsConfig::default(),
        }
    }
}

/// Paths to the PEM files used for mutual TLS.
///
/// Paths are only checked for emptiness by `validate()`. Existence and
/// readability are checked by `validate_config`, which the client builder
/// calls right before reading the files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// CA bundle used to verify the broker certificate.
    #[validate(length(min = 1, message = "CA certificate path must not be empty"))]
    pub ca_cert_path: String,

    /// Device certificate presented to the broker.
    #[validate(length(min = 1, message = "Client certificate path must not be empty"))]
    pub client_cert_path: String,

    /// Unencrypted private key matching `client_cert_path`.
    ///
    /// Keep this file private (chmod 600) and out of version control.
    #[validate(length(min = 1, message = "Client key path must not be empty"))]
    pub client_key_path: String,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: ca_cert_path.into(),
            client_cert_path: client_cert_path.into(),
            client_key_path: client_key_path.into(),
        }
    }

    /// Checks that all three files exist and are regular files.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        validate_file_path(&self.ca_cert_path)?;
        validate_file_path(&self.client_cert_path)?;
        validate_file_path(&self.client_key_path)?;
        Ok(())
    }
}

/// Validates that a file exists, is readable, and is not a directory.
fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    if std::fs::metadata(path).is_err() {
        return Err(ValidationError::new("file_not_readable")
            .with_message(format!("File is not readable: {path}").into()));
    }

    Ok(())
}

/// Maps a configured QoS level (0, 1 or 2) to the client's enum.
pub fn qos_from_level(level: u8) -> Result<QoS, TransferError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(TransferError::Configuration(format!(
            "Invalid QoS level {other}, must be 0, 1 or 2"
        ))),
    }
}
