use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use papaya_util::http::Uri;
use papaya_util::json::{deserialize_duration_from_ms, serialize_duration_to_ms};

/// Management platform endpoint and admin identity
#[derive(Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    pub url: Uri,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Names of the platform profiles used for each level of the hierarchy
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProfilesConfig {
    pub country_profile_name: String,
    pub state_profile_name: String,
    pub device_profile_name: String,
}

/// Where this device sits in the asset hierarchy
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetsConfig {
    pub country_name: String,
    pub state_name: String,
    pub device_name: String,
    pub serial_number: String,
}

/// Static location used when the geolocation lookup is unavailable
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LocationConfig {
    pub latitude: f64,
    pub longitude: f64,

    #[serde(default)]
    pub city: String,

    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub country: String,

    #[serde(default = "default_lookup_url")]
    pub lookup_url: Uri,
}

fn default_lookup_url() -> Uri {
    Uri::from_static("https://ipapi.co/json/")
}

/// Deadlines for outbound calls made during provisioning
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RequestConfig {
    /// Timeout for every management API call
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub timeout: Duration,

    /// Timeout for the geolocation lookup
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub geolocation_timeout: Duration,

    /// How long a successfully probed bearer token is trusted without
    /// probing it again
    #[serde(
        deserialize_with = "deserialize_duration_from_ms",
        serialize_with = "serialize_duration_to_ms"
    )]
    pub token_validity: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
            geolocation_timeout: Duration::from_millis(5_000),
            token_validity: Duration::from_millis(300_000),
        }
    }
}

/// Device configuration supplied by the operator
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub platform: PlatformConfig,
    pub profiles: ProfilesConfig,
    pub assets: AssetsConfig,
    pub location: LocationConfig,

    #[serde(default)]
    pub request: RequestConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl DeviceConfig {
    /// Read and decode a JSON device config
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        debug!("reading device config from {}", path.as_ref().display());
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// A complete device config as an operator would write it
#[cfg(test)]
pub(crate) fn sample_json() -> serde_json::Value {
    use serde_json::json;

    json!({
        "platform": {
            "url": "https://demo.example.com",
            "username": "tenant@example.com",
            "password": "tenant"
        },
        "profiles": {
            "country_profile_name": "Country",
            "state_profile_name": "State",
            "device_profile_name": "Parking Meter"
        },
        "assets": {
            "country_name": "India",
            "state_name": "Maharashtra",
            "device_name": "gw-01",
            "serial_number": "PM-0001"
        },
        "location": {
            "latitude": 19.0,
            "longitude": 72.8
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn it_fills_in_defaults() {
        let config: DeviceConfig = serde_json::from_value(sample_json()).unwrap();

        assert_eq!(config.request.timeout, Duration::from_secs(10));
        assert_eq!(config.request.token_validity, Duration::from_secs(300));
        assert_eq!(config.location.lookup_url.to_string(), "https://ipapi.co/json/");
        assert_eq!(config.location.city, "");
        assert_eq!(config.platform.url.host(), Some("demo.example.com"));
    }

    #[test]
    fn it_reads_request_deadlines_in_ms() {
        let mut value = sample_json();
        value["request"] = json!({
            "timeout": 2500,
            "geolocation_timeout": 1000,
            "token_validity": 0
        });

        let config: DeviceConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.request.timeout, Duration::from_millis(2500));
        assert_eq!(config.request.geolocation_timeout, Duration::from_secs(1));
        assert_eq!(config.request.token_validity, Duration::ZERO);
    }

    #[test]
    fn it_keeps_the_password_out_of_debug_output() {
        let config: DeviceConfig = serde_json::from_value(sample_json()).unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("\"tenant\""));
        assert!(printed.contains("tenant@example.com"));
    }

    #[tokio::test]
    async fn it_loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");
        tokio::fs::write(&path, sample_json().to_string()).await.unwrap();

        let config = DeviceConfig::load(&path).await.unwrap();
        assert_eq!(config.assets.device_name, "gw-01");

        let missing = DeviceConfig::load(dir.path().join("missing.json")).await;
        assert!(matches!(missing, Err(ConfigError::Read(_))));
    }
}
