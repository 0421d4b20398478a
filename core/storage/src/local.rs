//! Local filesystem queue store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::store::QueueStore;
use sanctuary_common::{Error, Result};

/// Suffix of in-progress writes; never visible under a real key.
const TEMP_SUFFIX: &str = ".partial";

/// Local filesystem queue store.
///
/// Each key is stored as one file in the root directory. Keys are
/// percent-encoded into file names, so any string is a valid key. Writes go
/// to a temporary sibling first and are renamed into place.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root
            .join(utf8_percent_encode(key, NON_ALPHANUMERIC).to_string())
    }

    /// List the keys currently stored, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            let key = percent_decode_str(name)
                .decode_utf8()
                .map_err(|e| Error::Storage(format!("Undecodable key file {}: {}", name, e)))?;
            keys.push(key.into_owned());
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl QueueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let target = self.key_path(key);
        let temp = self
            .root
            .join(format!("{}{}", Uuid::new_v4(), TEMP_SUFFIX));

        if let Err(e) = fs::write(&temp, &value).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::Storage(format!("Failed to write {}: {}", key, e)));
        }

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::Storage(format!("Failed to commit {}: {}", key, e)));
        }

        debug!("Stored {} bytes under {}", value.len(), key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
