use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use papaya_util::clock::now_ms;
use papaya_util::config::{self, StoredConfig};
use papaya_util::store::{Store, StoreError};
use papaya_util::types::{AccessToken, BearerToken};

/// Credentials the agent holds between runs
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Credential {
    /// Session token for the management API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<BearerToken>,

    /// When `bearer_token` was last confirmed by the platform, in ms since
    /// the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<i64>,

    /// Token the device publishes telemetry with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_access_token: Option<AccessToken>,
}

impl StoredConfig for Credential {
    fn kind() -> &'static str {
        "credentials"
    }
}

/// Shared credential holder.
///
/// Clones see the same values. When backed by a [`Store`], every update is
/// written through so a restart picks up the last known tokens.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    inner: Arc<RwLock<Credential>>,
    store: Option<Store>,
}

impl CredentialStore {
    /// Open the credential document in `store`, starting empty if there is
    /// none yet.
    pub async fn open(store: Store) -> Result<Self, StoreError> {
        let credential = config::load::<Credential>(&store).await?.unwrap_or_default();
        debug!(
            has_bearer = credential.bearer_token.is_some(),
            has_device_token = credential.device_access_token.is_some(),
            "loaded credentials"
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(credential)),
            store: Some(store),
        })
    }

    /// A store that is never persisted
    pub fn in_memory(credential: Credential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credential)),
            store: None,
        }
    }

    pub fn get(&self) -> Credential {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the bearer token. The new token counts as validated now.
    pub async fn set_bearer(&self, token: BearerToken) -> Result<(), StoreError> {
        self.update(|c| {
            c.bearer_token = Some(token);
            c.last_validated_at = Some(now_ms());
        })
        .await
    }

    /// Record that the current bearer token was accepted by the platform
    pub async fn mark_validated(&self) -> Result<(), StoreError> {
        self.update(|c| c.last_validated_at = Some(now_ms())).await
    }

    pub async fn set_device_token(&self, token: AccessToken) -> Result<(), StoreError> {
        self.update(|c| c.device_access_token = Some(token)).await
    }

    async fn update(&self, f: impl FnOnce(&mut Credential)) -> Result<(), StoreError> {
        let snapshot = {
            let mut credential = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut *credential);
            credential.clone()
        };

        if let Some(store) = &self.store {
            config::save(store, &snapshot).await?;
        }
        Ok(())
    }
}
