/*
This crate is home to everything related to the management platform the
device is onboarded into.

It provides the provisioning workflow: authenticating with the management
API, resolving the device location, converging the Country -> State ->
Device asset graph and retrieving the device access token, which is then
used as the identity for telemetry.
*/

mod auth;
mod config;
mod credentials;
mod error;
mod hierarchy;
mod location;
mod platform;
mod provision;

pub use auth::TokenManager;
pub use config::{
    AssetsConfig, ConfigError, DeviceConfig, LocationConfig, PlatformConfig, ProfilesConfig,
    RequestConfig,
};
pub use credentials::{Credential, CredentialStore};
pub use error::{
    ApiError, AuthError, FailureReason, ProvisioningError, TokenError, TransportError,
};
pub use hierarchy::{Hierarchy, HierarchyManager, HierarchyRequest};
pub use location::{Coordinates, GeoPoint, LocationResolver, LocationSource};
pub use platform::{
    AssetKind, AssetNode, DeviceCredentials, EntityRef, EntityType, Platform, PlatformClient,
    ProfileId, Relation,
};
pub use provision::{Provisioned, Provisioner, ProvisioningStep};
