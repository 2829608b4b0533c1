//! Mutual-TLS client builder.
//!
//! `ClientBuilder` turns a validated [`Config`] into a `rumqttc`
//! `AsyncClient`/`EventLoop` pair. The certificate files are read while
//! building, so a missing or unreadable key fails here and no client object is
//! ever created for it.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?.build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};
use tracing::debug;
use validator::Validate;

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

/// Builder for a TLS-only MQTT client.
///
/// Consumed by `build()`, which returns the client together with its event
/// loop. The client may be cloned and used from any task; the event loop must
/// be polled from exactly one.
pub struct ClientBuilder {
    /// MQTT protocol options (host, port, keep-alive, etc.)
    opts: MqttOptions,

    /// Capacity of the client's request channel.
    cap: usize,

    /// Certificate paths, read in `build()`.
    tls_config: TlsConfig,

    /// TCP connect plus handshake timeout, applied to the event loop.
    connection_timeout: u64,
}

impl ClientBuilder {
    /// Creates a builder from a `Config`, validating every field first.
    ///
    /// # Errors
    /// `TransferError::ConfigError` when any `validator` rule fails.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        opts.set_inflight(config.max_inflight);

        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        let cap = config.request_channel_capacity.unwrap_or(10) as usize;

        Ok(Self {
            opts,
            cap,
            tls_config: config.tls.clone(),
            connection_timeout: config.connection_timeout,
        })
    }

    fn load_file(path: &str) -> Result<Vec<u8>, TransferError> {
        fs::read(path).map_err(|e| {
            TransferError::Configuration(format!("Failed to read '{path}': {e}"))
        })
    }

    /// Reads the CA bundle, certificate and key into a TLS transport.
    fn build_tls_transport(&self) -> Result<Transport, TransferError> {
        self.tls_config
            .validate_config()
            .map_err(|e| TransferError::Configuration(format!("Invalid TLS configuration: {e}")))?;

        let ca = Self::load_file(&self.tls_config.ca_cert_path)?;
        let cert = Self::load_file(&self.tls_config.client_cert_path)?;
        let key = Self::load_file(&self.tls_config.client_key_path)?;

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth: Some((cert, key)),
            alpn: None,
        }))
    }

    /// Constructs the client and event loop.
    ///
    /// No network activity happens here; the first `poll()` of the event
    /// loop opens the connection.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let transport = self.build_tls_transport()?;

        let mut opts = self.opts;
        opts.set_transport(transport);

        let (host, port) = opts.broker_address();
        debug!(
            host = %host,
            port,
            client_id = %opts.client_id(),
            keep_alive = opts.keep_alive().as_secs(),
            "Building MQTT client"
        );

        let (client, mut event_loop) = AsyncClient::new(opts, self.cap);
        event_loop
            .network_options
            .set_connection_timeout(self.connection_timeout);

        Ok((client, event_loop))
    }
}
