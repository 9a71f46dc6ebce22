//! Pixel <-> work-surface calibration from fiducial markers.
//!
//! Two reference markers are glued to the work surface at known positions and
//! a third rides on the pen carriage. Every photo can refresh the homography
//! from the reference markers, after which the tool marker's pixel centre is
//! projected back into millimetres.
//!
//! World space is right-handed with Y pointing up, while pixel rows grow
//! downwards. A marker that appears upright in the photo therefore has its
//! top-left pixel corner at `(cx - s/2, cy + s/2)` in world space.
//!
//! # Example
//!
//! ```no_run
//! use shared::calibration::{CalibrationConfig, CalibrationEngine};
//! use shared::frame::frame_from_bytes;
//!
//! let engine = CalibrationEngine::new(CalibrationConfig::default()).unwrap();
//! let photo = std::fs::read("board.jpg").unwrap();
//! let frame = frame_from_bytes(&photo).unwrap();
//!
//! if engine.update_calibration(&frame) {
//!     let tool = engine.tool_marker_world_position(&frame);
//!     println!("tool at {tool:?}");
//! }
//! ```

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::Frame;
use crate::homography::{fit_homography_ransac, invert, project, HomographyError, RansacConfig};
use crate::markers::{DetectorConfig, MarkerDetector, MarkerDictionary, MarkerMap};

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Reference markers not found: {missing:?}")]
    MissingReferences { missing: Vec<u32> },
    #[error("Homography fit failed: {0}")]
    Homography(#[from] HomographyError),
    #[error("Homography is singular")]
    Singular,
    #[error("Invalid calibration config: {0}")]
    InvalidConfig(String),
}

pub type CalibrationResult<T> = Result<T, CalibrationError>;

/// A fiducial glued to the work surface at a known position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceMarkerConfig {
    pub id: u32,
    /// Marker centre in world millimetres.
    pub center_mm: [f64; 2],
    /// Outer edge length of the black border, in millimetres.
    pub side_mm: f64,
}

impl ReferenceMarkerConfig {
    /// World corners in detection order: top-left, top-right, bottom-right, bottom-left.
    pub fn world_corners(&self) -> [[f64; 2]; 4] {
        let [cx, cy] = self.center_mm;
        let h = self.side_mm / 2.0;
        [
            [cx - h, cy + h],
            [cx + h, cy + h],
            [cx + h, cy - h],
            [cx - h, cy - h],
        ]
    }
}

fn default_ransac_threshold() -> f64 {
    5.0
}

/// Marker layout and fitting parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub references: [ReferenceMarkerConfig; 2],
    pub tool_marker_id: u32,
    /// RANSAC inlier threshold in pixels.
    #[serde(default = "default_ransac_threshold")]
    pub ransac_threshold_px: f64,
    #[serde(default)]
    pub detector: DetectorConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            references: [
                ReferenceMarkerConfig {
                    id: 1,
                    center_mm: [0.0, 0.0],
                    side_mm: 20.0,
                },
                ReferenceMarkerConfig {
                    id: 2,
                    center_mm: [0.0, 50.0],
                    side_mm: 20.0,
                },
            ],
            tool_marker_id: 3,
            ransac_threshold_px: default_ransac_threshold(),
            detector: DetectorConfig::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> CalibrationResult<()> {
        let [a, b] = &self.references;
        if a.id == b.id || a.id == self.tool_marker_id || b.id == self.tool_marker_id {
            return Err(CalibrationError::InvalidConfig(
                "reference and tool marker ids must be distinct".into(),
            ));
        }
        for r in &self.references {
            if !(r.side_mm.is_finite() && r.side_mm > 0.0) {
                return Err(CalibrationError::InvalidConfig(format!(
                    "marker {} side must be positive, got {}",
                    r.id, r.side_mm
                )));
            }
        }
        if a.center_mm == b.center_mm {
            return Err(CalibrationError::InvalidConfig(
                "reference markers cannot share a centre".into(),
            ));
        }
        if !(self.ransac_threshold_px.is_finite() && self.ransac_threshold_px > 0.0) {
            return Err(CalibrationError::InvalidConfig(format!(
                "RANSAC threshold must be positive, got {}",
                self.ransac_threshold_px
            )));
        }
        Ok(())
    }
}

/// Immutable result of one calibration attempt.
///
/// `homography` maps world millimetres to pixels and `inverse` maps back.
/// Both are carried over from the previous frame when an attempt fails for
/// lack of reference markers, and both are cleared when the fit is singular.
#[derive(Debug, Clone)]
pub struct CalibrationFrame {
    pub markers: MarkerMap,
    pub homography: Option<Matrix3<f64>>,
    pub inverse: Option<Matrix3<f64>>,
    /// Whether the most recent attempt produced the matrices.
    pub valid: bool,
    /// RMS reprojection error of the reference corners, in pixels.
    pub rms_error_px: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl CalibrationFrame {
    fn empty() -> Self {
        Self {
            markers: MarkerMap::new(),
            homography: None,
            inverse: None,
            valid: false,
            rms_error_px: None,
            updated_at: Utc::now(),
        }
    }

    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<[f64; 2]> {
        project(self.homography.as_ref()?, x, y)
    }

    pub fn pixel_to_world(&self, px: f64, py: f64) -> Option<[f64; 2]> {
        project(self.inverse.as_ref()?, px, py)
    }
}

/// On-disk form of a fitted homography.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredHomography {
    /// Row-major world -> pixel matrix.
    pub matrix: [[f64; 3]; 3],
    pub rms_error_px: Option<f64>,
    pub saved_at: DateTime<Utc>,
}

impl StoredHomography {
    pub fn from_matrix(h: &Matrix3<f64>, rms_error_px: Option<f64>) -> Self {
        let mut matrix = [[0.0; 3]; 3];
        for (r, row) in matrix.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = h[(r, c)];
            }
        }
        Self {
            matrix,
            rms_error_px,
            saved_at: Utc::now(),
        }
    }

    pub fn to_matrix(&self) -> Matrix3<f64> {
        Matrix3::from_fn(|r, c| self.matrix[r][c])
    }

    pub fn save_to_file(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn load_from_file(path: &Path) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Maintains the current pixel <-> world calibration.
///
/// Readers always see a complete [`CalibrationFrame`]; updates swap the whole
/// snapshot under a write lock.
#[derive(Debug)]
pub struct CalibrationEngine {
    config: CalibrationConfig,
    detector: MarkerDetector,
    current: RwLock<Arc<CalibrationFrame>>,
}

impl CalibrationEngine {
    /// Create an engine using the built-in marker dictionary.
    pub fn new(config: CalibrationConfig) -> CalibrationResult<Self> {
        Self::with_dictionary(config, MarkerDictionary::standard().clone())
    }

    pub fn with_dictionary(
        config: CalibrationConfig,
        dictionary: MarkerDictionary,
    ) -> CalibrationResult<Self> {
        config.validate()?;
        let detector = MarkerDetector::new(dictionary, config.detector.clone());
        Ok(Self {
            config,
            detector,
            current: RwLock::new(Arc::new(CalibrationFrame::empty())),
        })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// The latest calibration snapshot.
    pub fn snapshot(&self) -> Arc<CalibrationFrame> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_valid(&self) -> bool {
        self.snapshot().valid
    }

    fn publish(&self, frame: CalibrationFrame) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(frame);
    }

    /// All recognized markers in `frame`. Does not touch the calibration.
    pub fn detect_markers(&self, frame: &Frame) -> MarkerMap {
        self.detector.detect(frame)
    }

    /// Recalibrate from `frame`, returning whether the calibration is now valid.
    pub fn update_calibration(&self, frame: &Frame) -> bool {
        match self.try_update_calibration(frame) {
            Ok(_) => true,
            Err(e) => {
                debug!("Calibration update failed: {e}");
                false
            }
        }
    }

    /// Recalibrate from `frame`, reporting why it failed.
    pub fn try_update_calibration(&self, frame: &Frame) -> CalibrationResult<Arc<CalibrationFrame>> {
        let markers = self.detect_markers(frame);
        self.calibrate_from_markers(markers)
    }

    fn calibrate_from_markers(&self, markers: MarkerMap) -> CalibrationResult<Arc<CalibrationFrame>> {
        let previous = self.snapshot();

        let missing: Vec<u32> = self
            .config
            .references
            .iter()
            .map(|r| r.id)
            .filter(|id| !markers.contains_key(id))
            .collect();
        if !missing.is_empty() {
            self.publish(CalibrationFrame {
                markers,
                homography: previous.homography,
                inverse: previous.inverse,
                valid: false,
                rms_error_px: previous.rms_error_px,
                updated_at: Utc::now(),
            });
            return Err(CalibrationError::MissingReferences { missing });
        }

        let mut world = Vec::with_capacity(8);
        let mut pixel = Vec::with_capacity(8);
        for reference in &self.config.references {
            world.extend_from_slice(&reference.world_corners());
            pixel.extend_from_slice(&markers[&reference.id].corners_px);
        }

        let ransac = RansacConfig {
            inlier_threshold: self.config.ransac_threshold_px,
            ..RansacConfig::default()
        };
        let fit = match fit_homography_ransac(&world, &pixel, &ransac) {
            Ok(fit) => fit,
            Err(e) => {
                self.publish(CalibrationFrame {
                    markers,
                    homography: previous.homography,
                    inverse: previous.inverse,
                    valid: false,
                    rms_error_px: previous.rms_error_px,
                    updated_at: Utc::now(),
                });
                return Err(e.into());
            }
        };

        let Some(inverse) = invert(&fit.h) else {
            warn!("Fitted homography is singular, clearing calibration");
            self.publish(CalibrationFrame {
                markers,
                homography: None,
                inverse: None,
                valid: false,
                rms_error_px: None,
                updated_at: Utc::now(),
            });
            return Err(CalibrationError::Singular);
        };

        info!(
            "Calibrated from markers {:?}: {}/{} inliers, rms {:.3} px",
            self.config.references.map(|r| r.id),
            fit.n_inliers,
            world.len(),
            fit.rms_error
        );

        let snapshot = Arc::new(CalibrationFrame {
            markers,
            homography: Some(fit.h),
            inverse: Some(inverse),
            valid: true,
            rms_error_px: Some(fit.rms_error),
            updated_at: Utc::now(),
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        Ok(snapshot)
    }

    /// Project a world point (mm) into pixels of the calibrated view.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<[f64; 2]> {
        self.snapshot().world_to_pixel(x, y)
    }

    /// Project a pixel back onto the work surface (mm).
    pub fn pixel_to_world(&self, px: f64, py: f64) -> Option<[f64; 2]> {
        self.snapshot().pixel_to_world(px, py)
    }

    /// World position of the tool marker in `frame`.
    ///
    /// Recalibrates from the same frame first if the last attempt failed.
    /// Returns `None` if the tool marker is absent or no calibration can be
    /// established.
    pub fn tool_marker_world_position(&self, frame: &Frame) -> Option<[f64; 2]> {
        let snapshot = self.snapshot();
        let (snapshot, markers) = if snapshot.valid {
            (snapshot, self.detect_markers(frame))
        } else {
            match self.try_update_calibration(frame) {
                Ok(fresh) => {
                    let markers = fresh.markers.clone();
                    (fresh, markers)
                }
                Err(e) => {
                    debug!("No calibration for tool lookup: {e}");
                    return None;
                }
            }
        };

        let tool = markers.get(&self.config.tool_marker_id)?;
        snapshot.pixel_to_world(tool.center_px[0], tool.center_px[1])
    }

    /// The current homography in storable form, if one exists.
    pub fn stored_homography(&self) -> Option<StoredHomography> {
        let snapshot = self.snapshot();
        snapshot
            .homography
            .as_ref()
            .map(|h| StoredHomography::from_matrix(h, snapshot.rms_error_px))
    }

    /// Install a previously saved homography as the current calibration.
    pub fn restore_homography(&self, stored: &StoredHomography) -> CalibrationResult<()> {
        let h = stored.to_matrix();
        let inverse = invert(&h).ok_or(CalibrationError::Singular)?;
        self.publish(CalibrationFrame {
            markers: MarkerMap::new(),
            homography: Some(h),
            inverse: Some(inverse),
            valid: true,
            rms_error_px: stored.rms_error_px,
            updated_at: Utc::now(),
        });
        debug!("Restored homography saved at {}", stored.saved_at);
        Ok(())
    }
}
