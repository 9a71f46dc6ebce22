//! Square fiducial marker detection.
//!
//! Markers are black-bordered binary grids (see [`dictionary`]). Detection
//! runs in four stages over a luminance [`Frame`]:
//!
//! 1. Global Otsu threshold (or a fixed override) splits dark from bright
//! 2. 8-connected dark components become marker candidates
//! 3. Each candidate's outline is reduced to four extreme corners
//! 4. The cell grid is sampled through the unit-square homography for each
//!    of the four corner orderings and matched against the dictionary
//!
//! Corners are reported in the marker's own orientation (top-left,
//! top-right, bottom-right, bottom-left), so they can be paired directly
//! with known physical corner positions.

pub mod dictionary;
pub mod segment;

use std::collections::BTreeMap;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::trace;

pub use dictionary::MarkerDictionary;
use segment::{dark_components, otsu_threshold, Component};

use crate::frame::Frame;
use crate::homography::{estimate_homography_dlt, project};

/// Smallest spread between the darkest and brightest cell for a grid to be read.
const MIN_CELL_CONTRAST: f64 = 40.0;

/// A fiducial found in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedMarker {
    /// Dictionary id.
    pub id: u32,
    /// Pixel corners `[x, y]`: top-left, top-right, bottom-right, bottom-left.
    pub corners_px: [[f64; 2]; 4],
    /// Mean of the four corners.
    pub center_px: [f64; 2],
}

impl DetectedMarker {
    fn new(id: u32, corners_px: [[f64; 2]; 4]) -> Self {
        let center_px = [
            corners_px.iter().map(|c| c[0]).sum::<f64>() / 4.0,
            corners_px.iter().map(|c| c[1]).sum::<f64>() / 4.0,
        ];
        Self {
            id,
            corners_px,
            center_px,
        }
    }
}

/// Markers keyed by id.
pub type MarkerMap = BTreeMap<u32, DetectedMarker>;

/// Tuning for [`MarkerDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Fixed dark/bright threshold; Otsu's method when `None`.
    pub threshold: Option<u8>,
    /// Shortest accepted quad edge, in pixels.
    pub min_side_px: f64,
    /// Lowest ratio of dark pixels to quad area.
    pub min_fill_ratio: f64,
    /// Fraction of border cells allowed to read as white.
    pub max_border_error_ratio: f64,
    /// Payload bits allowed to differ from the codeword.
    pub max_bit_errors: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: None,
            min_side_px: 12.0,
            min_fill_ratio: 0.3,
            max_border_error_ratio: 0.15,
            max_bit_errors: 0,
        }
    }
}

/// Detects dictionary markers in luminance frames.
#[derive(Debug, Clone)]
pub struct MarkerDetector {
    dictionary: MarkerDictionary,
    config: DetectorConfig,
}

impl Default for MarkerDetector {
    fn default() -> Self {
        Self::new(MarkerDictionary::standard().clone(), DetectorConfig::default())
    }
}

impl MarkerDetector {
    pub fn new(dictionary: MarkerDictionary, config: DetectorConfig) -> Self {
        Self { dictionary, config }
    }

    pub fn dictionary(&self) -> &MarkerDictionary {
        &self.dictionary
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Find every recognizable marker in `frame`.
    ///
    /// When the same id is decoded twice the larger instance wins.
    pub fn detect(&self, frame: &Frame) -> MarkerMap {
        let view = frame.view();
        let threshold = self
            .config
            .threshold
            .unwrap_or_else(|| otsu_threshold(view));

        let min_pixels = (self.config.min_side_px * 2.0) as usize;
        let mut found = MarkerMap::new();

        for component in dark_components(view, threshold, min_pixels) {
            let Some(corners) = self.extract_quad(&component) else {
                continue;
            };
            let Some(marker) = self.decode(view, threshold, corners) else {
                continue;
            };
            trace!(
                "marker {} at ({:.1}, {:.1})",
                marker.id,
                marker.center_px[0],
                marker.center_px[1]
            );

            let larger = match found.get(&marker.id) {
                Some(existing) => quad_area(&marker.corners_px) > quad_area(&existing.corners_px),
                None => true,
            };
            if larger {
                found.insert(marker.id, marker);
            }
        }

        found
    }

    /// Reduce a component to four extreme points, ordered clockwise on screen.
    fn extract_quad(&self, component: &Component) -> Option<[[f64; 2]; 4]> {
        let pts: Vec<[f64; 2]> = component
            .pixels
            .iter()
            .map(|&(r, c)| [c as f64, r as f64])
            .collect();
        let centroid = component.centroid();

        let farthest_from = |origin: [f64; 2]| {
            pts.iter().copied().max_by(|a, b| {
                dist_sq(*a, origin).total_cmp(&dist_sq(*b, origin))
            })
        };
        let p0 = farthest_from(centroid)?;
        let p2 = farthest_from(p0)?;

        let side = |p: &[f64; 2]| cross(p0, p2, *p);
        let p1 = pts.iter().copied().max_by(|a, b| side(a).total_cmp(&side(b)))?;
        let p3 = pts.iter().copied().min_by(|a, b| side(a).total_cmp(&side(b)))?;
        if side(&p1) <= 0.0 || side(&p3) >= 0.0 {
            return None;
        }

        let mut corners = [p0, p1, p2, p3];
        let cx = corners.iter().map(|c| c[0]).sum::<f64>() / 4.0;
        let cy = corners.iter().map(|c| c[1]).sum::<f64>() / 4.0;
        // Increasing atan2 with y pointing down is clockwise on screen
        corners.sort_by(|a, b| {
            (a[1] - cy)
                .atan2(a[0] - cx)
                .total_cmp(&(b[1] - cy).atan2(b[0] - cx))
        });

        for i in 0..4 {
            let edge = dist_sq(corners[i], corners[(i + 1) % 4]).sqrt();
            if edge < self.config.min_side_px {
                return None;
            }
            if cross(corners[i], corners[(i + 1) % 4], corners[(i + 2) % 4]) <= 0.0 {
                return None;
            }
        }

        let area = quad_area(&corners);
        if (component.len() as f64) < self.config.min_fill_ratio * area {
            return None;
        }

        Some(corners)
    }

    /// Sample the cell grid and identify the marker, trying each corner as top-left.
    fn decode(
        &self,
        image: ArrayView2<u8>,
        threshold: u8,
        corners: [[f64; 2]; 4],
    ) -> Option<DetectedMarker> {
        let grid = self.dictionary.grid_size();
        let bits = self.dictionary.bits();
        let g = grid as f64;
        let unit = [[0.0, 0.0], [g, 0.0], [g, g], [0.0, g]];

        for rotation in 0..4 {
            let ordered: [[f64; 2]; 4] = std::array::from_fn(|i| corners[(i + rotation) % 4]);
            let h = estimate_homography_dlt(&unit, &ordered).ok()?;

            let mut samples = Vec::with_capacity(grid * grid);
            for row in 0..grid {
                for col in 0..grid {
                    let p = project(&h, col as f64 + 0.5, row as f64 + 0.5)?;
                    samples.push(sample_mean(image, p));
                }
            }

            let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if hi - lo < MIN_CELL_CONTRAST || lo > threshold as f64 {
                return None;
            }
            let split = (lo + hi) / 2.0;

            let mut border_errors = 0usize;
            let mut payload = Vec::with_capacity(bits * bits);
            for (i, &value) in samples.iter().enumerate() {
                let (row, col) = (i / grid, i % grid);
                let white = value > split;
                let on_border = row == 0 || col == 0 || row == grid - 1 || col == grid - 1;
                if on_border {
                    border_errors += usize::from(white);
                } else {
                    payload.push(!white);
                }
            }

            let border_cells = 4 * (grid - 1);
            if border_errors as f64 > self.config.max_border_error_ratio * border_cells as f64 {
                // The border reads the same in every orientation
                return None;
            }

            let code = dictionary::pack_bits(&payload);
            if let Some(id) = self.dictionary.identify(code, self.config.max_bit_errors) {
                return Some(DetectedMarker::new(id, ordered));
            }
        }

        None
    }
}

/// Detect markers from the built-in dictionary with default settings.
pub fn detect_markers(frame: &Frame) -> MarkerMap {
    MarkerDetector::default().detect(frame)
}

fn dist_sq(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)
}

/// z component of `(b - a) x (c - a)`.
fn cross(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn quad_area(q: &[[f64; 2]; 4]) -> f64 {
    let mut twice = 0.0;
    for i in 0..4 {
        let j = (i + 1) % 4;
        twice += q[i][0] * q[j][1] - q[j][0] * q[i][1];
    }
    twice.abs() / 2.0
}

/// Mean of the 3x3 neighbourhood around `p`, clamped to the image.
fn sample_mean(image: ArrayView2<u8>, p: [f64; 2]) -> f64 {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return 255.0;
    }
    let cx = p[0].round().clamp(0.0, (cols - 1) as f64) as usize;
    let cy = p[1].round().clamp(0.0, (rows - 1) as f64) as usize;

    let mut sum = 0.0;
    let mut n = 0.0;
    for y in cy.saturating_sub(1)..=(cy + 1).min(rows - 1) {
        for x in cx.saturating_sub(1)..=(cx + 1).min(cols - 1) {
            sum += image[[y, x]] as f64;
            n += 1.0;
        }
    }
    sum / n
}

#[cfg(test)]
pub(crate) mod test_scene {
    use ndarray::Array2;

    use super::MarkerDictionary;
    use crate::homography::project;
    use nalgebra::Matrix3;

    /// Paste a rendered marker with its top-left pixel at `(left, top)`.
    pub fn paste(canvas: &mut Array2<u8>, marker: &Array2<u8>, left: usize, top: usize) {
        let (h, w) = marker.dim();
        canvas
            .slice_mut(ndarray::s![top..top + h, left..left + w])
            .assign(marker);
    }

    /// Draw marker `id` by inverse-mapping canvas pixels through `canvas_to_cells`,
    /// which maps canvas pixel centres to marker cell coordinates.
    pub fn warp(canvas: &mut Array2<u8>, id: u32, canvas_to_cells: &Matrix3<f64>) {
        let dict = MarkerDictionary::standard();
        let grid = dict.grid_size() as f64;
        let code = dict.code(id).unwrap();
        let (rows, cols) = canvas.dim();
        for y in 0..rows {
            for x in 0..cols {
                let Some([u, v]) = project(canvas_to_cells, x as f64, y as f64) else {
                    continue;
                };
                if u < 0.0 || v < 0.0 || u >= grid || v >= grid {
                    continue;
                }
                let (col, row) = (u as usize, v as usize);
                let last = dict.grid_size() - 1;
                let white = row != 0
                    && col != 0
                    && row != last
                    && col != last
                    && !super::dictionary::bit_at(code, dict.bits(), row - 1, col - 1);
                canvas[[y, x]] = if white { 255 } else { 0 };
            }
        }
    }
}
