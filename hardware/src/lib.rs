//! Device drivers for the camera-guided pen plotter.
//!
//! This crate owns every piece of hardware I/O: the serial link to the GRBL
//! motion controller and the adb link to the phone that photographs the work
//! surface. Each driver is feature-gated for optional compilation.
//!
//! # Features
//!
//! ## Individual Drivers
//! - `grbl` - GRBL motion controller over a serial port
//! - `android` - Phone camera automated over adb
//!
//! ## Convenience Features
//! - `full` - All drivers (default)

pub mod config;

#[cfg(feature = "grbl")]
pub mod grbl;

#[cfg(feature = "android")]
pub mod android;
