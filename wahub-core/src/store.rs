//! On-disk device config store.
//!
//! Layout:
//! - `<configs_dir>/<device_id>.json` - one pretty-printed [`DeviceConfig`] per device
//! - `<sessions_dir>/session-<device_id>/` - protocol-client artifacts, opaque here

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;

use crate::config::StorageConfig;
use crate::error::HubError;
use crate::models::{DeviceConfig, CONFIG_VERSION};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    configs_dir: PathBuf,
    sessions_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(configs_dir: impl Into<PathBuf>, sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            configs_dir: configs_dir.into(),
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.configs_path(), config.sessions_path())
    }

    pub async fn ensure_dirs(&self) -> Result<(), HubError> {
        fs::create_dir_all(&self.configs_dir).await?;
        fs::create_dir_all(&self.sessions_dir).await?;
        Ok(())
    }

    pub fn configs_dir(&self) -> &Path {
        &self.configs_dir
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn config_path(&self, device_id: &str) -> PathBuf {
        self.configs_dir.join(format!("{}.json", device_id))
    }

    pub fn session_dir(&self, device_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("session-{}", device_id))
    }

    /// `Ok(None)` when no config has been persisted for the device.
    pub async fn load(&self, device_id: &str) -> Result<Option<DeviceConfig>, HubError> {
        let path = self.config_path(device_id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut config: DeviceConfig = serde_json::from_str(&raw)?;
        // The file name is authoritative for the id.
        config.device_id = device_id.to_string();
        Ok(Some(config))
    }

    /// Persist `config`, stamping `version` and `last_updated`.
    pub async fn save(&self, config: &mut DeviceConfig) -> Result<(), HubError> {
        config.version = CONFIG_VERSION.to_string();
        config.last_updated = Some(Utc::now());

        let path = self.config_path(&config.device_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(config)?;

        fs::create_dir_all(&self.configs_dir).await?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!(device_id = %config.device_id, path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Returns whether a file was removed.
    pub async fn delete(&self, device_id: &str) -> Result<bool, HubError> {
        match fs::remove_file(self.config_path(device_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the protocol client's artifacts for the device. Returns whether
    /// anything was removed.
    pub async fn delete_session_artifacts(&self, device_id: &str) -> Result<bool, HubError> {
        match fs::remove_dir_all(self.session_dir(device_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every persisted config, sorted.
    pub async fn list_device_ids(&self) -> Result<Vec<String>, HubError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.configs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}
