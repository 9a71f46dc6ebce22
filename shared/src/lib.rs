//! Shared geometry and storage for the camera-guided pen plotter.
//!
//! Everything in this crate is free of device I/O. The hardware crate owns
//! the serial link and the tethered phone; this crate turns the frames the
//! phone produces into physical work-surface coordinates.
//!
//! # Modules
//!
//! - [`homography`] - DLT/RANSAC plane-to-plane homography estimation
//! - [`markers`] - square fiducial detection and the marker dictionary
//! - [`calibration`] - pixel <-> work-surface calibration engine
//! - [`frame`] - decoding captured photos into luminance frames
//! - [`ring_buffer`] - bounded FIFO used for capture history
//! - [`config_storage`] - JSON persistence under `~/.plotter_config`

pub mod calibration;
pub mod frame;
pub mod homography;
pub mod markers;
pub mod ring_buffer;

#[cfg(feature = "config-storage")]
pub mod config_storage;

pub use calibration::{
    CalibrationConfig, CalibrationEngine, CalibrationError, CalibrationFrame,
    ReferenceMarkerConfig,
};
pub use frame::Frame;
pub use markers::{DetectedMarker, MarkerDictionary};
pub use ring_buffer::RingBuffer;
