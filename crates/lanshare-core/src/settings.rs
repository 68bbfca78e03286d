// SPDX-License-Identifier: AGPL-3.0
// LanShare Core - Settings persistence
//
// One JSON file in the platform config directory, read once at startup and
// rewritten whole on every change. Folder visibility lives in the store, not
// here.

use crate::types::{AppError, AppSettings};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

pub struct SettingsStore {
    settings: RwLock<AppSettings>,
    file_path: PathBuf,
}

/// Parse a settings file. Fields it leaves out take their defaults; a file
/// that is not valid JSON is replaced by defaults.
fn load(file_path: &Path) -> Result<AppSettings, AppError> {
    if !file_path.exists() {
        tracing::info!("No settings at {}, using defaults", file_path.display());
        return Ok(AppSettings::default());
    }

    let content = fs::read_to_string(file_path)
        .map_err(|e| AppError::Io(format!("Failed to read settings: {}", e)))?;
    Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!("Ignoring unreadable settings in {}: {}", file_path.display(), e);
        AppSettings::default()
    }))
}

impl SettingsStore {
    pub fn new() -> Result<Self, AppError> {
        let config_dir = directories::ProjectDirs::from("com", "lanshare", "lanshare")
            .ok_or_else(|| AppError::Io("Could not determine config directory".to_string()))?
            .config_dir()
            .to_path_buf();
        Self::open(config_dir.join("settings.json"))
    }

    /// Open `file_path`, writing a default file there when none exists yet
    pub fn open(file_path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let file_path = file_path.into();
        tracing::debug!("Settings file: {}", file_path.display());

        let existed = file_path.exists();
        let store = Self {
            settings: RwLock::new(load(&file_path)?),
            file_path,
        };
        if !existed {
            store.persist()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> AppSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate, replace and persist settings
    pub fn update(&self, new_settings: AppSettings) -> Result<(), AppError> {
        new_settings.validate()?;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = new_settings;

        self.persist().inspect_err(|e| {
            tracing::error!("Failed to persist settings: {}", e);
        })
    }

    /// Change one part of the settings in place and persist the result
    pub fn modify<F>(&self, change: F) -> Result<AppSettings, AppError>
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut settings = self.get();
        change(&mut settings);
        self.update(settings.clone())?;
        Ok(settings)
    }

    // The file is replaced by rename so a crash never leaves half a document
    fn persist(&self) -> Result<(), AppError> {
        let content = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*settings).map_err(|e| {
                AppError::Serialization(format!("Failed to serialize settings: {}", e))
            })?
        };

        let dir = match self.file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)
            .map_err(|e| AppError::Io(format!("Failed to create config dir: {}", e)))?;

        let mut staged = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| AppError::Io(format!("Failed to write settings: {}", e)))?;
        staged
            .write_all(content.as_bytes())
            .map_err(|e| AppError::Io(format!("Failed to write settings: {}", e)))?;
        staged
            .persist(&self.file_path)
            .map_err(|e| AppError::Io(format!("Failed to write settings: {}", e.error)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_creates_file_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.get().port, 5000);
    }

    #[test]
    fn test_update_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();

        let mut settings = store.get();
        settings.port = 5050;
        settings.public_mode = false;
        store.update(settings).unwrap();

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(reopened.get().port, 5050);
        assert!(!reopened.get().public_mode);
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.get().port, 5000);
    }

    #[test]
    fn test_partial_file_keeps_its_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"publicMode": false, "scanConcurrency": 8}"#).unwrap();

        let settings = SettingsStore::open(&path).unwrap().get();
        assert!(!settings.public_mode);
        assert_eq!(settings.scan_concurrency, 8);
        assert_eq!(settings.port, 5000);
    }

    #[test]
    fn test_modify_persists_one_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();

        let saved = store.modify(|s| s.public_mode = false).unwrap();
        assert!(!saved.public_mode);
        assert!(!SettingsStore::open(&path).unwrap().get().public_mode);
        assert!(store.modify(|s| s.io_timeout_secs = 0).is_err());
        assert_eq!(store.get().io_timeout_secs, 30);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        let mut settings = store.get();
        settings.scan_concurrency = 0;
        assert!(store.update(settings).is_err());
        assert_eq!(store.get().scan_concurrency, 64);
    }
}
