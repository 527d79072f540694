use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use papaya_util::types::{AccessToken, BearerToken};

use crate::error::ApiError;
use crate::location::{Coordinates, GeoPoint};

mod client;
#[cfg(test)]
pub(crate) mod mock;

pub use client::PlatformClient;

/// Kind of a node addressed by the platform API
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityType {
    Asset,
    Device,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Asset => "ASSET",
            EntityType::Device => "DEVICE",
        }
    }
}

/// Identifier of a node in the platform graph
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "entityType")]
    pub entity_type: EntityType,
    pub id: String,
}

/// Level of a node in the Country -> State -> Device hierarchy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Country,
    State,
    Device,
}

impl AssetKind {
    pub fn entity_type(&self) -> EntityType {
        match self {
            AssetKind::Country | AssetKind::State => EntityType::Asset,
            AssetKind::Device => EntityType::Device,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Country => "country",
            AssetKind::State => "state",
            AssetKind::Device => "device",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an asset or device profile
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub String);

/// A node of the hierarchy as known to the platform
#[derive(Clone, Debug, PartialEq)]
pub struct AssetNode {
    pub id: EntityRef,
    pub name: String,
    pub profile: String,
    pub kind: AssetKind,

    /// Coordinates attached to the node, if any
    pub location: Option<GeoPoint>,
}

/// A "Contains" edge
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Relation {
    pub from: EntityRef,
    pub to: EntityRef,
}

impl Relation {
    pub const TYPE: &'static str = "Contains";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub credentials_type: String,
    pub credentials_id: String,
}

impl DeviceCredentials {
    pub const ACCESS_TOKEN: &'static str = "ACCESS_TOKEN";

    /// The telemetry token, if these credentials carry one
    pub fn access_token(&self) -> Option<AccessToken> {
        if self.credentials_type == Self::ACCESS_TOKEN && !self.credentials_id.is_empty() {
            Some(AccessToken::from(self.credentials_id.as_str()))
        } else {
            None
        }
    }
}

/// Operations of the management API used during provisioning
///
/// Every authenticated call takes the bearer token explicitly, the platform
/// keeps no session state of its own.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Exchange the admin identity for a bearer token
    async fn login(&self, username: &str, password: &str) -> Result<BearerToken, ApiError>;

    /// Check that `token` is still accepted
    async fn probe(&self, token: &BearerToken) -> Result<(), ApiError>;

    /// Look up the profile used for nodes of `kind`
    async fn find_profile(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
    ) -> Result<Option<ProfileId>, ApiError>;

    /// List every node of `kind` matching `name` (ignoring case).
    ///
    /// Assets must also match `profile`. Device names are unique per tenant so
    /// they are matched on name alone.
    async fn find_nodes(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
        profile: &str,
    ) -> Result<Vec<AssetNode>, ApiError>;

    async fn create_node(
        &self,
        token: &BearerToken,
        kind: AssetKind,
        name: &str,
        profile: &str,
        profile_id: &ProfileId,
    ) -> Result<AssetNode, ApiError>;

    /// Read the coordinates stored on a node
    async fn read_location(
        &self,
        token: &BearerToken,
        entity: &EntityRef,
    ) -> Result<Option<GeoPoint>, ApiError>;

    /// Store coordinates and place names on a node
    async fn save_location(
        &self,
        token: &BearerToken,
        entity: &EntityRef,
        coordinates: &Coordinates,
    ) -> Result<(), ApiError>;

    /// Find the "Contains" edge between two nodes
    async fn find_relation(
        &self,
        token: &BearerToken,
        from: &EntityRef,
        to: &EntityRef,
    ) -> Result<Option<Relation>, ApiError>;

    /// List every "Contains" edge pointing at `to`
    async fn relations_to(
        &self,
        token: &BearerToken,
        to: &EntityRef,
    ) -> Result<Vec<Relation>, ApiError>;

    async fn create_relation(&self, token: &BearerToken, relation: &Relation)
    -> Result<(), ApiError>;

    async fn delete_relation(&self, token: &BearerToken, relation: &Relation)
    -> Result<(), ApiError>;

    async fn device_credentials(
        &self,
        token: &BearerToken,
        device: &EntityRef,
    ) -> Result<Option<DeviceCredentials>, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_access_token_credentials_carry_a_token() {
        let creds = DeviceCredentials {
            credentials_type: "ACCESS_TOKEN".to_owned(),
            credentials_id: "A1B2C3D4E5".to_owned(),
        };
        assert_eq!(creds.access_token(), Some(AccessToken::from("A1B2C3D4E5")));

        let creds = DeviceCredentials {
            credentials_type: "X509_CERTIFICATE".to_owned(),
            credentials_id: "abc".to_owned(),
        };
        assert!(creds.access_token().is_none());
    }

    #[test]
    fn entity_refs_use_the_platform_id_format() {
        let entity = EntityRef {
            entity_type: EntityType::Device,
            id: "d-1".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&entity).unwrap(),
            serde_json::json!({"entityType": "DEVICE", "id": "d-1"})
        );
    }
}
