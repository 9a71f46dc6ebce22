//! Phone camera automation over ADB.
//!
//! The plotter photographs its work surface with an Android phone on a
//! tether. [`CameraDeviceController`] wakes the phone, drives its camera app,
//! pulls each new photo back over ADB and keeps the most recent ones in
//! memory.
//!
//! - [`transport`] - the [`DeviceTransport`] seam and the `adb` implementation
//! - [`camera`] - [`CameraDeviceController`] and [`CameraConfig`]
//! - [`monitor`] - background thread closing an idle camera app
//! - [`photo`] - [`DevicePhotoRecord`]
//! - [`mock`] - [`ScriptedTransport`], an in-memory phone for tests and demos

pub mod camera;
pub mod mock;
pub mod monitor;
pub mod photo;
pub mod transport;

use std::time::Duration;

use thiserror::Error;

pub use camera::{CameraConfig, CameraDeviceController, CameraDeviceState};
pub use mock::ScriptedTransport;
pub use monitor::IdleMonitor;
pub use photo::{DevicePhotoRecord, PhotoMetadata};
pub use transport::{AdbTransport, CommandOutput, DeviceTransport};

/// Errors raised while automating the phone.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No device in the `device` state is attached, or none was selected yet.
    #[error("No Android device connected")]
    NoDevice,

    /// The transport ran but the command exited unsuccessfully.
    #[error("Command `{command}` failed (status {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] shared::frame::FrameError),

    /// The photo search on the device returned nothing.
    #[error("No photo found under {0}")]
    PhotoNotFound(String),

    /// The shutter produced no new file; the newest one is already stored.
    #[error("No new photo after the shutter, newest is still {0}")]
    StalePhoto(String),

    /// The pulled file was empty.
    #[error("Photo {0} is empty")]
    EmptyPhoto(String),
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
