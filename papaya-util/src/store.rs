use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

use super::fs::safe_write_all;

/// A filesystem backed store
///
/// Documents are JSON files under a root directory. Writes are atomic but
/// there is no locking, so a store must have a single writer.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("path must not have any `..` segments")]
    InvalidPath,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    // Constructs a full path for a given collection path
    fn with_root(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let doc_path = path.strip_prefix("/").unwrap_or(path);

        for component in doc_path.components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StoreError::InvalidPath);
            }
        }
        Ok(self.root.join(doc_path))
    }

    /// Create or update a document at the specified location and with the given
    /// key
    pub async fn write<P: AsRef<Path>, V: Serialize>(
        &self,
        path: P,
        key: &str,
        value: &V,
    ) -> Result<(), StoreError> {
        let parent = self.with_root(path.as_ref())?;

        // this will fail if the parent exists but is not a directory
        fs::create_dir_all(parent.as_path()).await?;

        let full_path = parent.join(key).with_extension("json");
        let buf = serde_json::to_vec(&value)?;
        trace!("writing {}", full_path.display());
        tokio::task::spawn_blocking(move || safe_write_all(full_path, &buf))
            .await
            .map_err(io::Error::other)??;
        Ok(())
    }

    /// Read a document from the specified location
    pub async fn read<P: AsRef<Path>, V: DeserializeOwned>(
        &self,
        path: P,
        key: &str,
    ) -> Result<Option<V>, StoreError> {
        let full_path = self
            .with_root(path.as_ref())?
            .join(key)
            .with_extension("json");
        trace!("reading {}", full_path.display());

        match fs::read_to_string(&full_path).await {
            Ok(contents) => {
                let value = serde_json::from_str::<V>(&contents)?;
                Ok(Some(value))
            }
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound => Ok(None),
                _ => Err(err.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[tokio::test]
    async fn it_reads_back_written_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store
            .write("/", "credentials", &json!({"bearer_token": "abc"}))
            .await
            .unwrap();

        let value: Option<Value> = store.read("/", "credentials").await.unwrap();
        assert_eq!(value, Some(json!({"bearer_token": "abc"})));
        assert!(dir.path().join("credentials.json").exists());
    }

    #[tokio::test]
    async fn it_returns_none_for_missing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let value: Option<Value> = store.read("/nested", "missing").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn it_rejects_parent_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        let res = store.write("/../outside", "doc", &json!({})).await;
        assert!(matches!(res, Err(StoreError::InvalidPath)));
    }
}
