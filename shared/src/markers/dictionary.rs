//! Binary codeword dictionaries for square fiducials.
//!
//! A marker is a `(bits + 2) x (bits + 2)` grid of cells: a one-cell black
//! border around a `bits x bits` payload where black cells are `1`. Payload
//! cell `(row, col)` is bit `row * bits + col` of the codeword, the layout
//! ArUco dictionaries use.

use calib_targets_aruco::builtins::DICT_4X4_50;
use ndarray::Array2;
use once_cell::sync::Lazy;

/// Payload size of the built-in dictionary.
pub const STANDARD_BITS: usize = 4;

/// Number of codes in the built-in dictionary.
pub const STANDARD_SIZE: usize = 50;

/// Minimum Hamming distance between any two codes (and their rotations) in
/// the built-in dictionary.
pub const STANDARD_MIN_DISTANCE: u32 = 4;

static STANDARD: Lazy<MarkerDictionary> = Lazy::new(|| {
    MarkerDictionary::from_codes(DICT_4X4_50.marker_size(), DICT_4X4_50.codes().to_vec())
});

/// A set of marker codewords indexed by marker id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerDictionary {
    bits: usize,
    codes: Vec<u64>,
}

impl MarkerDictionary {
    /// Build a dictionary from explicit codewords.
    ///
    /// # Panics
    /// Panics if `bits` is 0 or the payload does not fit in 64 bits.
    pub fn from_codes(bits: usize, codes: Vec<u64>) -> Self {
        assert!(bits > 0 && bits * bits <= 64, "payload must fit in a u64");
        Self { bits, codes }
    }

    /// ArUco `DICT_4X4_50`, so printed OpenCV markers decode to the same ids.
    pub fn standard() -> &'static MarkerDictionary {
        &STANDARD
    }

    /// Payload side length in cells.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Side length of a whole marker in cells, border included.
    pub fn grid_size(&self) -> usize {
        self.bits + 2
    }

    /// Number of ids in the dictionary.
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Codeword for a marker id.
    pub fn code(&self, id: u32) -> Option<u64> {
        self.codes.get(id as usize).copied()
    }

    /// Find the id whose codeword is within `max_errors` bits of `code`.
    ///
    /// Only the given orientation is compared; callers try each rotation.
    pub fn identify(&self, code: u64, max_errors: u32) -> Option<u32> {
        self.codes
            .iter()
            .enumerate()
            .map(|(id, &c)| (id, hamming(c, code)))
            .filter(|&(_, d)| d <= max_errors)
            .min_by_key(|&(_, d)| d)
            .map(|(id, _)| id as u32)
    }

    /// Render a marker as an 8-bit image, `cell_px` pixels per cell, with
    /// `margin_cells` of white quiet zone on every side.
    ///
    /// Returns `None` for unknown ids or a zero cell size.
    pub fn render(&self, id: u32, cell_px: usize, margin_cells: usize) -> Option<Array2<u8>> {
        let code = self.code(id)?;
        if cell_px == 0 {
            return None;
        }
        let grid = self.grid_size();
        let side = (grid + 2 * margin_cells) * cell_px;
        let mut img = Array2::from_elem((side, side), 255u8);

        for row in 0..grid {
            for col in 0..grid {
                let black = row == 0
                    || col == 0
                    || row == grid - 1
                    || col == grid - 1
                    || bit_at(code, self.bits, row - 1, col - 1);
                if !black {
                    continue;
                }
                let y0 = (row + margin_cells) * cell_px;
                let x0 = (col + margin_cells) * cell_px;
                img.slice_mut(ndarray::s![y0..y0 + cell_px, x0..x0 + cell_px])
                    .fill(0);
            }
        }
        Some(img)
    }
}

/// Number of differing bits.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Payload bit at `(row, col)`; `true` is a black cell.
pub fn bit_at(code: u64, bits: usize, row: usize, col: usize) -> bool {
    (code >> (row * bits + col)) & 1 == 1
}

/// Pack a row-major payload of black cells, first cell in the lowest bit.
pub fn pack_bits(cells: &[bool]) -> u64 {
    cells
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << i))
}

/// Rotate a payload 90 degrees clockwise.
pub fn rotate_cw(code: u64, bits: usize) -> u64 {
    let mut cells = Vec::with_capacity(bits * bits);
    for r in 0..bits {
        for c in 0..bits {
            cells.push(bit_at(code, bits, bits - 1 - c, r));
        }
    }
    pack_bits(&cells)
}

/// The code and its three clockwise rotations.
pub fn rotations(code: u64, bits: usize) -> [u64; 4] {
    let r1 = rotate_cw(code, bits);
    let r2 = rotate_cw(r1, bits);
    let r3 = rotate_cw(r2, bits);
    [code, r1, r2, r3]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_dictionary_separation() {
        let dict = MarkerDictionary::standard();
        assert_eq!(dict.len(), STANDARD_SIZE);
        assert_eq!(dict.bits(), STANDARD_BITS);

        for (i, &a) in dict.codes.iter().enumerate() {
            for &b in &dict.codes[i + 1..] {
                for r in rotations(b, dict.bits()) {
                    assert!(hamming(a, r) >= STANDARD_MIN_DISTANCE);
                }
            }
        }
    }

    #[test]
    fn test_standard_matches_aruco_4x4_50() {
        let dict = MarkerDictionary::standard();
        assert_eq!(dict.code(0), Some(0xb352));
        assert_eq!(dict.code(1), Some(0xa60f));
        assert_eq!(dict.code(2), Some(0x4b33));
        assert_eq!(dict.code(3), Some(0x9d66));
        assert_eq!(dict.code(49), Some(0x37f5));
    }

    #[test]
    fn test_rotation_matches_aruco_matcher() {
        let dict = MarkerDictionary::standard();
        let matcher = calib_targets_aruco::Matcher::new(DICT_4X4_50, 0);
        for id in [1u32, 2, 3] {
            let code = dict.code(id).unwrap();
            for observed in rotations(code, dict.bits()) {
                let found = matcher.match_code(observed).unwrap();
                assert_eq!(found.id, id);
            }
        }
    }

    #[test]
    fn test_rotate_four_times_is_identity() {
        let code = 0b1011_0010_0110_1100;
        let r = rotations(code, 4);
        assert_eq!(rotate_cw(r[3], 4), code);
    }

    #[test]
    fn test_rotate_cw_moves_top_left_to_top_right() {
        // Only the top-left payload cell set
        let code = 1u64;
        let rotated = rotate_cw(code, 4);
        assert!(bit_at(rotated, 4, 0, 3));
        assert_eq!(rotated.count_ones(), 1);
    }

    #[test]
    fn test_identify_exact_and_with_errors() {
        let dict = MarkerDictionary::standard();
        let code = dict.code(3).unwrap();
        assert_eq!(dict.identify(code, 0), Some(3));
        assert_eq!(dict.identify(code ^ 1, 0), None);
        assert_eq!(dict.identify(code ^ 1, 1), Some(3));
    }

    #[test]
    fn test_render_border_and_payload() {
        let dict = MarkerDictionary::standard();
        let img = dict.render(0, 4, 1).unwrap();
        let grid = dict.grid_size();
        assert_eq!(img.dim(), ((grid + 2) * 4, (grid + 2) * 4));

        // Margin is white, border is black
        assert_eq!(img[[0, 0]], 255);
        assert_eq!(img[[4, 4]], 0);

        let code = dict.code(0).unwrap();
        for r in 0..4 {
            for c in 0..4 {
                let px = img[[(r + 2) * 4 + 1, (c + 2) * 4 + 1]];
                assert_eq!(px == 0, bit_at(code, 4, r, c));
            }
        }
    }

    #[test]
    fn test_render_unknown_id() {
        assert!(MarkerDictionary::standard().render(10_000, 4, 0).is_none());
    }
}
