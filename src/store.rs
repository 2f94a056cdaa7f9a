use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::trace;

/// A filesystem backed blob store.
///
/// Persists small JSON documents keyed by name. Writes are atomic but the
/// store assumes a single process; callers treat failures as non-fatal and
/// log them.
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

    #[error("key must be a plain file name")]
    InvalidKey,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    // Keys become file names, so anything that could escape the root
    // directory is rejected.
    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(StoreError::InvalidKey);
        }
        Ok(self.root.join(key).with_extension("json"))
    }

    /// Create or update the document stored under `key`.
    pub async fn write<V: Serialize>(&self, key: &str, value: &V) -> Result<(), StoreError> {
        let full_path = self.path_for(key)?;
        fs::create_dir_all(&self.root).await?;

        let buf = serde_json::to_vec(value)?;
        trace!("writing {}", full_path.display());

        // Write to a temporary file and rename so readers never observe a
        // partial document.
        let tmp_path = full_path.with_extension("json.tmp");
        fs::write(&tmp_path, &buf).await?;
        fs::rename(&tmp_path, &full_path).await?;
        Ok(())
    }

    /// Read the document stored under `key`, or `None` if absent.
    pub async fn read<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, StoreError> {
        let full_path = self.path_for(key)?;
        trace!("reading {}", full_path.display());

        match fs::read_to_string(&full_path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) => match err.kind() {
                io::ErrorKind::NotFound => Ok(None),
                _ => Err(err.into()),
            },
        }
    }

    /// Delete the document stored under `key`.
    ///
    /// Deleting a missing document succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let full_path = self.path_for(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
