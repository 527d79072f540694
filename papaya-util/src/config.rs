use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::store::{Store, StoreError};

/// A document persisted at the root of a [`Store`].
pub trait StoredConfig
where
    Self: Serialize,
    Self: DeserializeOwned,
{
    fn kind() -> &'static str;

    /// This config's preferred file name excluding the extension.
    fn default_name() -> &'static str {
        Self::kind()
    }
}

/// Load and decode the config stored under its default name.
pub async fn load<C: StoredConfig>(store: &Store) -> Result<Option<C>, StoreError> {
    debug!("reading {} config", C::kind());
    store.read("/", C::default_name()).await
}

/// Encode and store a config under its default name.
pub async fn save<C: StoredConfig>(store: &Store, config: &C) -> Result<(), StoreError> {
    debug!("storing {} config", C::kind());
    store.write("/", C::default_name(), config).await
}
