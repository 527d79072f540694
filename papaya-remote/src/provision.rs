use std::fmt;

use serde::Serialize;
use tracing::{info, instrument};

use papaya_telemetry::{Producer, Scalar, TelemetryPacket, Values};
use papaya_util::types::AccessToken;

use crate::auth::TokenManager;
use crate::config::DeviceConfig;
use crate::credentials::CredentialStore;
use crate::error::{AtStep, FailureReason, ProvisioningError};
use crate::hierarchy::{Hierarchy, HierarchyManager, HierarchyRequest};
use crate::location::{Coordinates, LocationResolver};
use crate::platform::Platform;

/// States of a provisioning run, in order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStep {
    Authenticating,
    Locating,
    EnsuringCountry,
    EnsuringState,
    EnsuringDevice,
    Handshaking,
    Done,
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProvisioningStep::Authenticating => "authenticating",
            ProvisioningStep::Locating => "locating",
            ProvisioningStep::EnsuringCountry => "ensuring country",
            ProvisioningStep::EnsuringState => "ensuring state",
            ProvisioningStep::EnsuringDevice => "ensuring device",
            ProvisioningStep::Handshaking => "handshaking",
            ProvisioningStep::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful provisioning run
#[derive(Clone, Debug)]
pub struct Provisioned {
    pub hierarchy: Hierarchy,
    pub coordinates: Coordinates,
    pub access_token: AccessToken,
}

/// Runs the onboarding sequence of the device
///
/// Authenticate, locate the device, converge the asset hierarchy, then
/// announce the device through the telemetry queue. A failing step halts the
/// run; retrying is up to the caller.
pub struct Provisioner<P> {
    platform: P,
    config: DeviceConfig,
    credentials: CredentialStore,
    locator: LocationResolver,
}

impl<P: Platform> Provisioner<P> {
    pub fn new(platform: P, config: DeviceConfig, credentials: CredentialStore) -> Self {
        let locator =
            LocationResolver::new(&config.location, config.request.geolocation_timeout);
        Self {
            platform,
            config,
            credentials,
            locator,
        }
    }

    #[cfg(test)]
    fn platform(&self) -> &P {
        &self.platform
    }

    #[instrument(name = "provision", skip_all, fields(device = %self.config.assets.device_name))]
    pub async fn run(&self, producer: &Producer) -> Result<Provisioned, ProvisioningError> {
        info!("{}", ProvisioningStep::Authenticating);
        let token = TokenManager::new(
            &self.platform,
            self.credentials.clone(),
            &self.config.platform,
            self.config.request.token_validity,
        )
        .ensure_valid_token()
        .await
        .at(ProvisioningStep::Authenticating)?;

        info!("{}", ProvisioningStep::Locating);
        let coordinates = self.locator.resolve().await;

        info!("ensuring hierarchy");
        let request =
            HierarchyRequest::new(&self.config.assets, &self.config.profiles, &coordinates);
        let hierarchy = HierarchyManager::new(&self.platform, &token)
            .ensure_hierarchy(&request)
            .await?;
        let access_token = hierarchy.access_token.clone();
        self.credentials
            .set_device_token(access_token.clone())
            .await
            .at(ProvisioningStep::EnsuringDevice)?;

        info!("{}", ProvisioningStep::Handshaking);
        if !producer.enqueue_packet(self.handshake(&coordinates)) {
            return Err(ProvisioningError::new(
                ProvisioningStep::Handshaking,
                FailureReason::HandshakeRejected,
            ));
        }

        info!("{}", ProvisioningStep::Done);
        Ok(Provisioned {
            hierarchy,
            coordinates,
            access_token,
        })
    }

    /// The first packet a device sends after onboarding
    fn handshake(&self, coordinates: &Coordinates) -> TelemetryPacket {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_owned());

        let mut values = Values::new();
        let mut put = |key: &str, value: Scalar| {
            values.insert(key.to_owned(), value);
        };
        put("serial_number", self.config.assets.serial_number.as_str().into());
        put("latitude", coordinates.latitude.into());
        put("longitude", coordinates.longitude.into());
        put("city", coordinates.city.as_str().into());
        put("region", coordinates.region.as_str().into());
        put("country", coordinates.country.as_str().into());
        put("location_source", coordinates.source.as_str().into());
        put(
            "system_info",
            format!("Host: {host}, OS: {}", std::env::consts::OS).into(),
        );
        put("agent_version", env!("CARGO_PKG_VERSION").into());

        TelemetryPacket::now(values)
    }
}
