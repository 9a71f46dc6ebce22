//! Rig-wide settings persisted as `rig.json` in the config directory.

use serde::{Deserialize, Serialize};
use shared::calibration::CalibrationConfig;
use shared::config_storage::ConfigStorage;
use tracing::{debug, info};

#[cfg(feature = "android")]
use crate::android::CameraConfig;
#[cfg(feature = "grbl")]
use crate::grbl::GrblConfig;

/// Document name under [`ConfigStorage`].
pub const RIG_DOCUMENT: &str = "rig";

/// Settings for every part of the rig.
///
/// Missing sections or fields fall back to their defaults, so a partial
/// `rig.json` is valid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    #[cfg(feature = "grbl")]
    pub grbl: GrblConfig,
    #[cfg(feature = "android")]
    pub camera: CameraConfig,
    pub calibration: CalibrationConfig,
}

impl RigConfig {
    /// Load `rig.json`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn load(storage: &ConfigStorage) -> std::io::Result<Self> {
        match storage.get_document::<Self>(RIG_DOCUMENT) {
            Some(result) => {
                let config = result?;
                debug!("Loaded rig config from {}", storage.root_path().display());
                Ok(config)
            }
            None => {
                debug!("No rig config in {}, using defaults", storage.root_path().display());
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, storage: &ConfigStorage) -> std::io::Result<()> {
        let path = storage.save_document(RIG_DOCUMENT, self)?;
        info!("Saved rig config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        assert_eq!(RigConfig::load(&storage).unwrap(), RigConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());

        let mut config = RigConfig::default();
        config.calibration.tool_marker_id = 7;
        #[cfg(feature = "grbl")]
        {
            config.grbl.port = "/dev/ttyACM0".to_string();
            config.grbl.step_size_mm = 0.5;
        }
        config.save(&storage).unwrap();

        assert_eq!(RigConfig::load(&storage).unwrap(), config);
    }

    #[cfg(feature = "grbl")]
    #[test]
    fn test_partial_document() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("rig.json"), r#"{"grbl": {"baud": 250000}}"#).unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());

        let config = RigConfig::load(&storage).unwrap();
        assert_eq!(config.grbl.baud, 250_000);
        assert_eq!(config.grbl.command_timeout_ms, 5_000);
        assert_eq!(config.calibration, CalibrationConfig::default());
    }

    #[test]
    fn test_corrupt_document_is_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("rig.json"), "{ not json").unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        assert!(RigConfig::load(&storage).is_err());
    }
}
