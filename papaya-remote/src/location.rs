use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use papaya_util::http::{Client, ClientError, Uri};

use crate::config::LocationConfig;

/// A point on the map
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationSource {
    /// Found by the geolocation lookup
    Resolved,
    /// Taken from the device config
    Fallback,
}

impl LocationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSource::Resolved => "resolved",
            LocationSource::Fallback => "fallback",
        }
    }
}

/// Where the device is, as decided for a provisioning run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    pub city: String,
    pub region: String,
    pub country: String,
    pub source: LocationSource,
}

impl Coordinates {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

#[derive(Deserialize)]
struct LookupReply {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    reason: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    country_name: Option<String>,
}

#[derive(Debug, Error)]
enum LookupError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("lookup service refused: {0}")]
    Refused(String),

    #[error("reply has no usable coordinates")]
    InvalidCoordinates,
}

/// Finds the device location through an IP geolocation service
#[derive(Clone, Debug)]
pub struct LocationResolver {
    client: Client,
    lookup_url: Uri,
    fallback: LocationConfig,
}

impl LocationResolver {
    pub fn new(config: &LocationConfig, timeout: Duration) -> Self {
        Self {
            client: Client::new(Some(timeout)),
            lookup_url: config.lookup_url.clone(),
            fallback: config.clone(),
        }
    }

    /// Resolve the device location.
    ///
    /// Never fails, any lookup problem results in the configured location.
    #[instrument(name = "locate", skip_all)]
    pub async fn resolve(&self) -> Coordinates {
        match self.lookup().await {
            Ok(coords) => {
                info!(
                    latitude = coords.latitude,
                    longitude = coords.longitude,
                    "resolved location: {}, {}, {}",
                    coords.city,
                    coords.region,
                    coords.country
                );
                coords
            }
            Err(e) => {
                warn!("geolocation lookup failed, using configured location: {e}");
                self.fallback()
            }
        }
    }

    async fn lookup(&self) -> Result<Coordinates, LookupError> {
        let reply: LookupReply = self.client.get(&self.lookup_url).await?;
        if reply.error {
            return Err(LookupError::Refused(reply.reason.unwrap_or_default()));
        }

        let (latitude, longitude) = reply
            .latitude
            .zip(reply.longitude)
            .ok_or(LookupError::InvalidCoordinates)?;
        let point = GeoPoint {
            latitude,
            longitude,
        };
        if !point.is_valid() {
            return Err(LookupError::InvalidCoordinates);
        }

        Ok(Coordinates {
            latitude,
            longitude,
            city: reply.city.unwrap_or_default(),
            region: reply.region.unwrap_or_default(),
            country: reply.country_name.unwrap_or_default(),
            source: LocationSource::Resolved,
        })
    }

    fn fallback(&self) -> Coordinates {
        Coordinates {
            latitude: self.fallback.latitude,
            longitude: self.fallback.longitude,
            city: self.fallback.city.clone(),
            region: self.fallback.region.clone(),
            country: self.fallback.country.clone(),
            source: LocationSource::Fallback,
        }
    }
}
