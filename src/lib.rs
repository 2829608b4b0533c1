//! tempsim: a simulated IoT temperature device.
//!
//! The device holds one mutually authenticated MQTT connection to its broker
//! and publishes a synthetic temperature reading on a fixed interval until it
//! is told to stop.
//!
//! ## Modules
//!
//! * `config` — Device identity from the environment plus the optional TOML
//!   file (logger, telemetry, transport, shutdown, handler, consumer), all
//!   validated with the `validator` crate.
//!
//! * `core` — Runtime components:
//!   - Readings and the temperature sampler
//!   - The telemetry loop and its `Publisher` seam
//!   - Shutdown coordination and signal handling
//!   - The downstream reading handler and queue poller
//!
//! * `logger` — `tracing` subscriber setup with console output (compact,
//!   pretty, JSON) and optional systemd journald.
//!
//! The broker connection itself lives in the `tempsim-mqtt` crate.

pub mod config;
pub mod core;
pub mod logger;
