//! Device identity from the environment.
//!
//! | Variable    | Field               |
//! |-------------|---------------------|
//! | `KEY_PATH`  | `private_key_path`  |
//! | `CERT_PATH` | `certificate_path`  |
//! | `CA_PATH`   | `trust_anchor_path` |
//! | `CLIENT_ID` | `client_id`         |
//! | `HOST`      | `endpoint_host`     |
//!
//! All five are required. Unset and blank values are treated alike, and
//! every missing name is reported in a single error.

use super::ConfigError;

const KEY_PATH: &str = "KEY_PATH";
const CERT_PATH: &str = "CERT_PATH";
const CA_PATH: &str = "CA_PATH";
const CLIENT_ID: &str = "CLIENT_ID";
const HOST: &str = "HOST";

/// Who the device is and where it connects. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub private_key_path: String,
    pub certificate_path: String,
    pub trust_anchor_path: String,
    /// Also used as the `deviceId` of every reading.
    pub client_id: String,
    pub endpoint_host: String,
}

impl DeviceIdentity {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the identity from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut get = |name: &'static str| {
            match lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
            {
                Some(value) => value,
                None => {
                    missing.push(name);
                    String::new()
                }
            }
        };

        let identity = DeviceIdentity {
            private_key_path: get(KEY_PATH),
            certificate_path: get(CERT_PATH),
            trust_anchor_path: get(CA_PATH),
            client_id: get(CLIENT_ID),
            endpoint_host: get(HOST),
        };

        if !missing.is_empty() {
            return Err(ConfigError::MissingVariable(missing));
        }
        Ok(identity)
    }
}
