//! # tempsim-mqtt: broker connection lifecycle for tempsim
//!
//! Owns the device's single MQTT connection. Built on `rumqttc`, this crate
//! adds:
//!
//! - **Mutual TLS** client construction from certificate paths
//! - **An explicit state machine** (`Idle → Connecting → Ready ⇄ Disconnected → Stopped`)
//! - **Readiness-gated publishing**: nothing reaches the transport before `Ready`
//! - **Graceful stop** that drains in-flight publishes, disconnects and
//!   releases the transport within a deadline
//! - **A transport seam** so the lifecycle can be tested without a broker
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use tempsim_mqtt::{Config, MqttManager, QoS, TlsConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         host: "example.test".into(),
//!         client_id: "dev-1".into(),
//!         tls: TlsConfig::new("ca.crt", "dev.cert.pem", "dev.private.key"),
//!         ..Default::default()
//!     };
//!
//!     let handle = MqttManager::from_config(config).build()?;
//!     handle.start().await?;
//!     handle.await_ready().await?;
//!
//!     handle
//!         .publish("device/temperature", r#"{"temperature":21,"deviceId":"dev-1"}"#, QoS::AtLeastOnce)
//!         .await?;
//!
//!     handle.stop(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Observing the connection
//!
//! `subscribe_state()` returns a `watch` receiver of [`ConnectionState`];
//! `subscribe_events()` returns a `broadcast` receiver of every [`LinkEvent`]
//! the transport produced (connection attempts, failures, acknowledgements,
//! inbound messages).
//!
//! # Testing
//!
//! With the `testing` feature, `tempsim_mqtt::testing::stub_transport()`
//! provides an in-memory transport whose controller emits lifecycle events
//! and records publishes.

mod client;
mod config;
mod connection;
mod error;
mod manager;
mod state;
mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::ClientBuilder;
pub use config::{qos_from_level, Config, TlsConfig, DEFAULT_KEEP_ALIVE, DEFAULT_PORT};
pub use error::TransferError;
pub use manager::{ConnectionHandle, HandleOptions, MqttManager, PublishResult};
pub use rumqttc::QoS;
pub use state::ConnectionState;
pub use transport::{rumqtt_transport, EventSource, Link, LinkEvent, RumqttEvents, RumqttLink};
