//! Luminance frames decoded from captured photos.

use image::{GrayImage, ImageError};
use ndarray::Array2;
use thiserror::Error;

/// An 8-bit luminance image indexed `[row, col]`.
pub type Frame = Array2<u8>;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] ImageError),
    #[error("Image is empty")]
    Empty,
}

/// Decode an encoded photo (JPEG, PNG, ...) into a luminance frame.
pub fn frame_from_bytes(bytes: &[u8]) -> Result<Frame, FrameError> {
    let luma = image::load_from_memory(bytes)?.to_luma8();
    frame_from_gray(&luma)
}

/// Copy a grayscale image into a frame.
pub fn frame_from_gray(image: &GrayImage) -> Result<Frame, FrameError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(FrameError::Empty);
    }
    Array2::from_shape_vec((height as usize, width as usize), image.as_raw().clone())
        .map_err(|_| FrameError::Empty)
}

/// Convert a frame back to a grayscale image, e.g. for saving debug output.
pub fn frame_to_gray(frame: &Frame) -> GrayImage {
    let (rows, cols) = frame.dim();
    GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        image::Luma([frame[[y as usize, x as usize]]])
    })
}

/// Mean pixel value, 0.0 for an empty frame.
pub fn mean_luminance(frame: &Frame) -> f64 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|&v| v as f64).sum::<f64>() / frame.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;

    fn encode_png(img: &GrayImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png_preserves_layout() {
        let img = GrayImage::from_fn(4, 3, |x, y| Luma([(x * 10 + y) as u8]));
        let frame = frame_from_bytes(&encode_png(&img)).unwrap();

        assert_eq!(frame.dim(), (3, 4));
        assert_eq!(frame[[2, 3]], 32);
        assert_eq!(frame[[0, 1]], 10);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            frame_from_bytes(b"definitely not an image"),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn test_gray_round_trip() {
        let frame = Array2::from_shape_fn((5, 7), |(r, c)| (r * 7 + c) as u8);
        let back = frame_from_gray(&frame_to_gray(&frame)).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn test_mean_luminance() {
        let mut frame = Array2::from_elem((2, 2), 10u8);
        frame[[0, 0]] = 50;
        assert_relative_eq!(mean_luminance(&frame), 20.0);
        assert_eq!(mean_luminance(&Array2::zeros((0, 0))), 0.0);
    }
}
