//! Broker connection tuning and the shutdown deadline.
//!
//! Where to connect and which certificates to present come from the
//! environment (see `identity`); this section only tunes the connection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempsim_mqtt::{TlsConfig, DEFAULT_KEEP_ALIVE, DEFAULT_PORT};
use validator::Validate;

use super::identity::DeviceIdentity;

/// `[transport]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TransportConfig {
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Seconds; 1200 unless overridden.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    pub clean_session: bool,

    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: u8,

    /// Seconds to wait after a failed poll before polling again.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            connection_timeout: 30,
            clean_session: true,
            max_inflight: 100,
            request_channel_capacity: 10,
            reconnect_delay: 5,
        }
    }
}

impl TransportConfig {
    /// Combines these settings with the device identity into the connection
    /// crate's configuration.
    pub fn for_identity(&self, identity: &DeviceIdentity) -> tempsim_mqtt::Config {
        tempsim_mqtt::Config {
            host: identity.endpoint_host.clone(),
            port: self.port,
            client_id: identity.client_id.clone(),
            keep_alive: self.keep_alive,
            connection_timeout: self.connection_timeout,
            clean_session: self.clean_session,
            max_inflight: self.max_inflight,
            request_channel_capacity: Some(self.request_channel_capacity),
            reconnect_delay: self.reconnect_delay,
            tls: TlsConfig::new(
                identity.trust_anchor_path.clone(),
                identity.certificate_path.clone(),
                identity.private_key_path.clone(),
            ),
            ..Default::default()
        }
    }
}

/// `[shutdown]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Upper bound on the graceful stop, in milliseconds.
    #[validate(range(
        min = 100,
        max = 60000,
        message = "Stop timeout must be between 100 ms and 60 s"
    ))]
    pub stop_timeout_ms: u64,
}

impl ShutdownConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            private_key_path: "/certs/dev.private.key".into(),
            certificate_path: "/certs/dev.cert.pem".into(),
            trust_anchor_path: "/certs/root-CA.crt".into(),
            client_id: "dev-1".into(),
            endpoint_host: "example.test".into(),
        }
    }

    #[test]
    fn test_for_identity_maps_every_field() {
        let transport = TransportConfig {
            port: 443,
            ..Default::default()
        };
        let config = transport.for_identity(&identity());

        assert_eq!(config.host, "example.test");
        assert_eq!(config.port, 443);
        assert_eq!(config.client_id, "dev-1");
        assert_eq!(config.keep_alive, 1200);
        assert_eq!(config.tls.ca_cert_path, "/certs/root-CA.crt");
        assert_eq!(config.tls.client_cert_path, "/certs/dev.cert.pem");
        assert_eq!(config.tls.client_key_path, "/certs/dev.private.key");
    }

    #[test]
    fn test_mapped_config_is_valid() {
        let config = TransportConfig::default().for_identity(&identity());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stop_timeout() {
        assert_eq!(
            ShutdownConfig::default().stop_timeout(),
            Duration::from_secs(5)
        );
    }
}
