use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::frame::{frame_from_bytes, Frame};

use super::DeviceResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhotoMetadata {
    /// File name on the device.
    pub original_filename: String,
    pub device_path: String,
    pub captured_at: DateTime<Utc>,
}

/// A photo pulled from the device, held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePhotoRecord {
    pub id: String,
    pub bytes: Bytes,
    pub metadata: PhotoMetadata,
}

impl DevicePhotoRecord {
    /// Build a record, deriving its id from the capture time and file name.
    pub fn new(bytes: impl Into<Bytes>, device_path: &str, captured_at: DateTime<Utc>) -> Self {
        let original_filename = match file_name(device_path) {
            "" => format!("photo_{}.jpg", captured_at.format("%Y%m%d_%H%M%S")),
            name => name.to_string(),
        };
        Self {
            id: photo_id(captured_at, &original_filename),
            bytes: bytes.into(),
            metadata: PhotoMetadata {
                original_filename,
                device_path: device_path.to_string(),
                captured_at,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the photo into a luminance frame.
    pub fn frame(&self) -> DeviceResult<Frame> {
        Ok(frame_from_bytes(&self.bytes)?)
    }
}

/// `<unix milliseconds>_<file name>`.
pub fn photo_id(captured_at: DateTime<Utc>, filename: &str) -> String {
    format!("{}_{filename}", captured_at.timestamp_millis())
}

/// Last path component of a device path.
pub fn file_name(device_path: &str) -> &str {
    device_path.trim_end().rsplit('/').next().unwrap_or_default()
}
