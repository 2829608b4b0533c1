//! Runtime components: readings, the telemetry loop, shutdown coordination
//! and the downstream consumer.

pub mod downstream;
pub mod reading;
pub mod shutdown;
pub mod telemetry;
