use tracing::{debug, info, instrument};

use papaya_util::types::{AccessToken, BearerToken};

use crate::config::{AssetsConfig, ProfilesConfig};
use crate::error::{AtStep, FailureReason, ProvisioningError};
use crate::location::Coordinates;
use crate::platform::{
    AssetKind, AssetNode, DeviceCredentials, EntityRef, EntityType, Platform, Relation,
};
use crate::provision::ProvisioningStep;

/// What the device hierarchy should look like
#[derive(Clone, Debug)]
pub struct HierarchyRequest {
    pub country_name: String,
    pub state_name: String,
    pub device_name: String,
    pub profiles: ProfilesConfig,
    pub location: Coordinates,
}

impl HierarchyRequest {
    pub fn new(assets: &AssetsConfig, profiles: &ProfilesConfig, coordinates: &Coordinates) -> Self {
        Self {
            country_name: assets.country_name.clone(),
            state_name: assets.state_name.clone(),
            device_name: assets.device_name.clone(),
            profiles: profiles.clone(),
            location: coordinates.clone(),
        }
    }
}

/// The converged Country -> State -> Device graph
#[derive(Clone, Debug)]
pub struct Hierarchy {
    pub country: AssetNode,
    pub state: AssetNode,
    pub device: AssetNode,
    pub access_token: AccessToken,
}

/// Converges the platform graph towards a [`HierarchyRequest`].
///
/// Every step searches before it creates so a run can be repeated, or
/// resumed after a failure, without duplicating nodes or relations.
pub struct HierarchyManager<'a, P: ?Sized> {
    platform: &'a P,
    token: &'a BearerToken,
}

impl<'a, P: Platform + ?Sized> HierarchyManager<'a, P> {
    pub fn new(platform: &'a P, token: &'a BearerToken) -> Self {
        Self { platform, token }
    }

    #[instrument(name = "hierarchy", skip_all, fields(device = %request.device_name))]
    pub async fn ensure_hierarchy(
        &self,
        request: &HierarchyRequest,
    ) -> Result<Hierarchy, ProvisioningError> {
        let country = self.ensure_country(request).await?;
        let state = self.ensure_state(request, &country).await?;
        let (device, access_token) = self.ensure_device(request, &state).await?;
        Ok(Hierarchy {
            country,
            state,
            device,
            access_token,
        })
    }

    pub async fn ensure_country(
        &self,
        request: &HierarchyRequest,
    ) -> Result<AssetNode, ProvisioningError> {
        let (country, _) = self
            .get_or_create(
                AssetKind::Country,
                &request.country_name,
                &request.profiles.country_profile_name,
            )
            .await
            .at(ProvisioningStep::EnsuringCountry)?;
        Ok(country)
    }

    /// Ensure the State exists and is contained by `country`.
    ///
    /// Coordinates are only written when the State has none, an existing
    /// location is never replaced.
    pub async fn ensure_state(
        &self,
        request: &HierarchyRequest,
        country: &AssetNode,
    ) -> Result<AssetNode, ProvisioningError> {
        let step = ProvisioningStep::EnsuringState;
        let (mut state, created) = self
            .get_or_create(
                AssetKind::State,
                &request.state_name,
                &request.profiles.state_profile_name,
            )
            .await
            .at(step)?;

        let stored = if created {
            None
        } else {
            self.platform
                .read_location(self.token, &state.id)
                .await
                .at(step)?
        };

        state.location = match stored {
            Some(point) => {
                debug!("keeping stored location of state '{}'", state.name);
                Some(point)
            }
            None => {
                self.platform
                    .save_location(self.token, &state.id, &request.location)
                    .await
                    .at(step)?;
                Some(request.location.point())
            }
        };

        self.link(&country.id, &state.id).await.at(step)?;
        Ok(state)
    }

    /// Ensure the Device exists under `state` and return its access token.
    ///
    /// The Device location is refreshed on every run and links to any
    /// other parent are removed.
    pub async fn ensure_device(
        &self,
        request: &HierarchyRequest,
        state: &AssetNode,
    ) -> Result<(AssetNode, AccessToken), ProvisioningError> {
        let step = ProvisioningStep::EnsuringDevice;
        let (mut device, _) = self
            .get_or_create(
                AssetKind::Device,
                &request.device_name,
                &request.profiles.device_profile_name,
            )
            .await
            .at(step)?;

        self.platform
            .save_location(self.token, &device.id, &request.location)
            .await
            .at(step)?;
        device.location = Some(request.location.point());

        self.reparent(&state.id, &device.id).await.at(step)?;

        let access_token = self.access_token(&device).await.at(step)?;
        Ok((device, access_token))
    }

    async fn get_or_create(
        &self,
        kind: AssetKind,
        name: &str,
        profile: &str,
    ) -> Result<(AssetNode, bool), FailureReason> {
        let mut found = self
            .platform
            .find_nodes(self.token, kind, name, profile)
            .await?;
        if found.len() > 1 {
            return Err(FailureReason::AmbiguousMatch {
                kind: kind.as_str(),
                name: name.to_owned(),
                count: found.len(),
            });
        }
        if let Some(node) = found.pop() {
            debug!("found {kind} '{}' ({})", node.name, node.id.id);
            return Ok((node, false));
        }

        let profile_id = self
            .platform
            .find_profile(self.token, kind, profile)
            .await?
            .ok_or_else(|| FailureReason::ProfileNotFound {
                kind: kind.as_str(),
                name: profile.to_owned(),
            })?;
        let node = self
            .platform
            .create_node(self.token, kind, name, profile, &profile_id)
            .await?;
        info!("created {kind} '{name}' ({})", node.id.id);
        Ok((node, true))
    }

    async fn link(&self, from: &EntityRef, to: &EntityRef) -> Result<(), FailureReason> {
        if self
            .platform
            .find_relation(self.token, from, to)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let relation = Relation {
            from: from.clone(),
            to: to.clone(),
        };
        self.platform.create_relation(self.token, &relation).await?;
        info!("linked {} -> {}", from.id, to.id);
        Ok(())
    }

    // A device has a single parent asset
    async fn reparent(&self, parent: &EntityRef, device: &EntityRef) -> Result<(), FailureReason> {
        let mut linked = false;
        for relation in self.platform.relations_to(self.token, device).await? {
            if &relation.from == parent {
                linked = true;
            } else if relation.from.entity_type == EntityType::Asset {
                info!("device moved, unlinking it from {}", relation.from.id);
                self.platform.delete_relation(self.token, &relation).await?;
            }
        }

        if !linked {
            self.link(parent, device).await?;
        }
        Ok(())
    }

    async fn access_token(&self, device: &AssetNode) -> Result<AccessToken, FailureReason> {
        let credentials = self
            .platform
            .device_credentials(self.token, &device.id)
            .await?
            .ok_or_else(|| FailureReason::MissingCredentials(device.name.clone()))?;

        if let Some(token) = credentials.access_token() {
            return Ok(token);
        }
        if credentials.credentials_type != DeviceCredentials::ACCESS_TOKEN {
            return Err(FailureReason::UnsupportedCredentials {
                device: device.name.clone(),
                kind: credentials.credentials_type,
            });
        }
        Err(FailureReason::MissingCredentials(device.name.clone()))
    }
}
