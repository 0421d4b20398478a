//! Client configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings read from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the sync API; unset means local-only.
    pub api_base_url: Option<String>,
    /// Bearer token sent with every request.
    pub token: Option<String>,
    /// Store kind: "local" or "memory".
    pub store: String,
    /// Store-specific settings, e.g. `{"root": "..."}` for "local".
    pub store_config: serde_json::Value,
    /// Send mutations to the remote.
    pub sync_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            token: None,
            store: "local".to_string(),
            store_config: serde_json::json!({
                "root": data_dir().join("store").to_string_lossy()
            }),
            sync_enabled: true,
        }
    }
}

impl ClientConfig {
    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid config file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Whether mutations will actually reach a remote.
    pub fn is_online(&self) -> bool {
        self.sync_enabled && self.api_base_url.is_some()
    }
}

/// Per-user data directory for the client.
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sanctuary")
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ClientConfig::load(&temp.path().join("none.json")).unwrap();
        assert_eq!(config.store, "local");
        assert!(config.sync_enabled);
        assert!(!config.is_online());
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");
        let config = ClientConfig {
            api_base_url: Some("https://reader.example.com".to_string()),
            token: Some("secret".to_string()),
            store: "memory".to_string(),
            store_config: serde_json::Value::Null,
            sync_enabled: true,
        };

        config.save(&path).unwrap();
        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.is_online());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, br#"{"sync_enabled": false}"#).unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert!(!config.sync_enabled);
        assert_eq!(config.store, "local");
    }
}
