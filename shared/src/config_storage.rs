//! Configuration storage for plotter calibration data.
//!
//! Provides centralized storage for rig settings, marker layout and the last
//! fitted homography. All config is stored in ~/.plotter_config/ by default.

use crate::calibration::{CalibrationConfig, StoredHomography};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Configuration storage manager for plotter configuration files.
///
/// Manages loading and saving of JSON documents from a centralized
/// directory (defaults to ~/.plotter_config/).
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.plotter_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.plotter_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".plotter_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    // =========================================================================
    // Named documents
    // =========================================================================

    fn document_path(&self, name: &str) -> PathBuf {
        assert!(
            !name.is_empty() && !name.contains(['/', '\\', '.']),
            "Document name must be a plain file stem"
        );
        self.root_path.join(format!("{name}.json"))
    }

    /// Load the document `name` (stored as `<root>/<name>.json`).
    ///
    /// Returns None if the document does not exist.
    /// Returns Some(Err) if the file exists but cannot be parsed.
    pub fn get_document<T: DeserializeOwned>(&self, name: &str) -> Option<std::io::Result<T>> {
        let path = self.document_path(name);

        if !path.exists() {
            return None;
        }

        Some(std::fs::read_to_string(&path).and_then(|json| {
            serde_json::from_str(&json)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }))
    }

    /// Save `value` as pretty JSON under `name`.
    ///
    /// Creates the config directory if it doesn't exist.
    /// Returns the path where the document was saved.
    pub fn save_document<T: Serialize>(&self, name: &str, value: &T) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;

        let path = self.document_path(name);
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    /// Delete the document `name`.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_document(&self, name: &str) -> std::io::Result<bool> {
        let path = self.document_path(name);

        if !path.exists() {
            return Ok(false);
        }

        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// Names of all stored documents, sorted.
    pub fn list_documents(&self) -> std::io::Result<Vec<String>> {
        if !self.root_path.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // =========================================================================
    // Calibration
    // =========================================================================

    /// Get the marker layout, if one has been saved.
    pub fn get_calibration_config(&self) -> Option<std::io::Result<CalibrationConfig>> {
        self.get_document("calibration")
    }

    pub fn save_calibration_config(&self, config: &CalibrationConfig) -> std::io::Result<PathBuf> {
        self.save_document("calibration", config)
    }

    /// Get the homography file path.
    ///
    /// One homography per rig - stored at ~/.plotter_config/homography.json
    fn homography_path(&self) -> PathBuf {
        self.root_path.join("homography.json")
    }

    /// Get the last saved homography.
    ///
    /// Returns None if no homography exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn get_homography(&self) -> Option<std::io::Result<StoredHomography>> {
        let path = self.homography_path();

        if !path.exists() {
            return None;
        }

        Some(StoredHomography::load_from_file(&path))
    }

    /// Save a homography, replacing any previous one.
    pub fn save_homography(&self, homography: &StoredHomography) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;

        let path = self.homography_path();
        homography.save_to_file(&path)?;
        Ok(path)
    }

    /// Delete the saved homography.
    ///
    /// Returns Ok(true) if the file was deleted, Ok(false) if it didn't exist.
    pub fn delete_homography(&self) -> std::io::Result<bool> {
        self.delete_document("homography")
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".plotter_config")))
    }
}
