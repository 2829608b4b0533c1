//! Temperature readings and the synthetic sampler that produces them.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::telemetry::TelemetryConfig;

/// One telemetry sample, as published on the wire:
/// `{"temperature": 21, "deviceId": "dev-1"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: i32,
    #[serde(rename = "deviceId")]
    pub device_id: String,
}

impl Reading {
    pub fn new(temperature: i32, device_id: impl Into<String>) -> Self {
        Self {
            temperature,
            device_id: device_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Uniform integer temperatures in `[min, max]`, both ends included.
#[derive(Debug, Clone, Copy)]
pub struct TemperatureSampler {
    min: i32,
    max: i32,
}

impl TemperatureSampler {
    /// Swaps the bounds if given in the wrong order.
    pub fn new(min: i32, max: i32) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        Self::new(config.temperature_min, config.temperature_max)
    }

    pub fn sample(&self, device_id: &str) -> Reading {
        let temperature = rand::thread_rng().gen_range(self.min..=self.max);
        Reading::new(temperature, device_id)
    }
}

impl Default for TemperatureSampler {
    fn default() -> Self {
        Self::from_config(&TelemetryConfig::default())
    }
}
