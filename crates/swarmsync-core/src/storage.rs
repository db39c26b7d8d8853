//! Storage layer for settings (transfers and partials are in SQLite)

use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};
use swarmsync_types::Settings;
use tokio::fs;
use tracing::warn;

const SETTINGS_FILE: &str = "settings.json";
const DATABASE_FILE: &str = "transfers.db";

/// Storage manager for the data directory
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Load settings, falling back to defaults when the file is missing
    /// or unreadable
    pub async fn load_settings(&self) -> Result<Settings> {
        let path = self.settings_path();
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                Ok(Settings::default())
            }
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        // Atomic replace
        let tmp = self.settings_path().with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.settings_path()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("data")).await.unwrap();
        assert_eq!(storage.load_settings().await.unwrap().chunk_size, 1024 * 1024);

        let mut settings = Settings::default();
        settings.wan_download_rate = 512 * 1024;
        settings.keep_partial_on_abort = false;
        storage.save_settings(&settings).await.unwrap();

        let loaded = storage.load_settings().await.unwrap();
        assert_eq!(loaded.wan_download_rate, 512 * 1024);
        assert!(!loaded.keep_partial_on_abort);
    }

    #[tokio::test]
    async fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf()).await.unwrap();
        tokio::fs::write(dir.path().join(SETTINGS_FILE), r#"{"max_retries": 9}"#)
            .await
            .unwrap();

        let loaded = storage.load_settings().await.unwrap();
        assert_eq!(loaded.max_retries, 9);
        assert_eq!(loaded.mtime_tolerance_ms, 2000);
    }
}
