//! Telemetry loop settings.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// How ticks behave while an earlier publish is still in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// Every tick publishes on its own task, so publishes may overlap.
    #[default]
    Overlapping,
    /// A tick is skipped while the previous publish has not returned.
    Serialized,
}

/// `[telemetry]` section.
///
/// ```toml
/// [telemetry]
/// interval_ms = 3000
/// topic = "device/temperature"
/// qos = 1
/// temperature_min = 15
/// temperature_max = 44
/// tick_mode = "overlapping"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_temperature_range"))]
pub struct TelemetryConfig {
    /// Period between readings, in milliseconds.
    #[validate(range(min = 100, message = "Interval must be at least 100 ms"))]
    pub interval_ms: u64,

    #[validate(length(min = 1, max = 65535, message = "Topic must not be empty"))]
    pub topic: String,

    #[validate(range(min = 0, max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    /// Lowest synthetic temperature, inclusive.
    pub temperature_min: i32,

    /// Highest synthetic temperature, inclusive.
    pub temperature_max: i32,

    pub tick_mode: TickMode,
}

fn validate_temperature_range(config: &TelemetryConfig) -> Result<(), ValidationError> {
    if config.temperature_min > config.temperature_max {
        return Err(
            ValidationError::new("invalid_temperature_range").with_message(
                format!(
                    "temperature_min ({}) must not exceed temperature_max ({})",
                    config.temperature_min, config.temperature_max
                )
                .into(),
            ),
        );
    }
    Ok(())
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            topic: "device/temperature".to_string(),
            qos: 1,
            temperature_min: 15,
            temperature_max: 44,
            tick_mode: TickMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.interval_ms, 3000);
        assert_eq!(config.topic, "device/temperature");
        assert_eq!(config.qos, 1);
        assert_eq!(config.tick_mode, TickMode::Overlapping);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let config = TelemetryConfig {
            temperature_min: 50,
            temperature_max: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_field_rules() {
        let config = TelemetryConfig {
            interval_ms: 10,
            topic: String::new(),
            qos: 3,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("interval_ms"));
        assert!(fields.contains_key("topic"));
        assert!(fields.contains_key("qos"));
    }

    #[test]
    fn test_tick_mode_from_toml() {
        let config: TelemetryConfig = toml::from_str(r#"tick_mode = "serialized""#).unwrap();
        assert_eq!(config.tick_mode, TickMode::Serialized);
        assert_eq!(config.interval_ms, 3000);
    }
}
