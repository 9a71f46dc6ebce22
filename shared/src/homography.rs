//! Plane-to-plane homography estimation.
//!
//! A homography is the 3x3 projective transform that maps one planar
//! coordinate system onto another through homogeneous coordinates:
//!
//! ```text
//! [u·w]       [x]
//! [v·w] = H · [y]
//! [ w ]       [1]
//! ```
//!
//! Provides:
//! - Direct Linear Transform (DLT) from >= 4 correspondences with Hartley
//!   normalization
//! - A RANSAC wrapper tolerant of outlying correspondences
//! - Forward projection and reprojection error
//!
//! # Example
//!
//! ```
//! use shared::homography::{estimate_homography_dlt, project};
//!
//! let src = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
//! let dst = [[100.0, 100.0], [120.0, 100.0], [120.0, 120.0], [100.0, 120.0]];
//! let h = estimate_homography_dlt(&src, &dst).unwrap();
//!
//! let p = project(&h, 5.0, 5.0).unwrap();
//! assert!((p[0] - 110.0).abs() < 1e-6);
//! assert!((p[1] - 110.0).abs() < 1e-6);
//! ```

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tracing::trace;

/// Homogeneous scale terms smaller than this are treated as zero.
pub const SCALE_EPSILON: f64 = 1e-12;

/// Relative determinant below which a homography counts as singular.
pub const SINGULAR_EPSILON: f64 = 1e-10;

/// Errors from homography estimation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    /// Fewer correspondences than the model needs.
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },

    /// Source and destination point lists differ in length.
    #[error("mismatched correspondences: {src} source vs {dst} destination points")]
    Mismatched { src: usize, dst: usize },

    /// Linear algebra failed (degenerate configuration, non-invertible normalization).
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    /// RANSAC could not find a model supported by enough correspondences.
    #[error("insufficient inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

/// Result type for homography operations.
pub type HomographyResult<T> = Result<T, HomographyError>;

/// Project a point through a homography.
///
/// Returns `None` when the homogeneous scale term is zero, i.e. the point
/// maps to the line at infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> Option<[f64; 2]> {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < SCALE_EPSILON {
        return None;
    }
    Some([p[0] / p[2], p[1] / p[2]])
}

/// Euclidean distance between `project(h, src)` and `dst`.
///
/// Points that project to infinity report an infinite error.
pub fn reprojection_error(h: &Matrix3<f64>, src: &[f64; 2], dst: &[f64; 2]) -> f64 {
    match project(h, src[0], src[1]) {
        Some(p) => ((p[0] - dst[0]).powi(2) + (p[1] - dst[1]).powi(2)).sqrt(),
        None => f64::INFINITY,
    }
}

/// Invert a homography, treating nearly rank-deficient matrices as singular.
///
/// The determinant is compared against the cube of the Frobenius norm so the
/// test does not depend on the overall scale of `h`.
pub fn invert(h: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let norm = h.norm();
    if !norm.is_finite() || norm == 0.0 {
        return None;
    }
    if h.determinant().abs() <= SINGULAR_EPSILON * norm.powi(3) {
        return None;
    }
    h.try_inverse()
}

/// RMS reprojection error over a set of correspondences.
pub fn rms_error(h: &Matrix3<f64>, src: &[[f64; 2]], dst: &[[f64; 2]]) -> f64 {
    if src.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = src
        .iter()
        .zip(dst)
        .map(|(s, d)| reprojection_error(h, s, d).powi(2))
        .sum();
    (sum_sq / src.len() as f64).sqrt()
}

/// Translate the centroid to the origin and scale so the mean distance from
/// the origin is sqrt(2).
fn normalize_points(pts: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;

    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();

    (t, normalized)
}

/// Estimate a homography from >= 4 correspondences with the DLT.
///
/// `src` and `dst` are paired by index. The returned `H` satisfies
/// `dst ≈ project(H, src)` and is scaled so `H[(2, 2)] == 1` whenever that
/// entry is non-zero.
pub fn estimate_homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
) -> HomographyResult<Matrix3<f64>> {
    if src.len() != dst.len() {
        return Err(HomographyError::Mismatched {
            src: src.len(),
            dst: dst.len(),
        });
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // Two rows per correspondence of the 2n x 9 system A·h = 0
    let mut a = DMatrix::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // h is the eigenvector of AᵀA with the smallest eigenvalue
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|(_, x), (_, y)| x.abs().total_cmp(&y.abs()))
        .map(|(i, _)| i)
        .ok_or_else(|| HomographyError::NumericalFailure("empty eigen decomposition".into()))?;

    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| HomographyError::NumericalFailure("T_dst not invertible".into()))?;
    let h = t_dst_inv * h_norm * t_src;

    if h.iter().any(|x| !x.is_finite()) {
        return Err(HomographyError::NumericalFailure(
            "non-finite homography".into(),
        ));
    }

    let scale = h[(2, 2)];
    if scale.abs() < SCALE_EPSILON {
        Ok(h)
    } else {
        Ok(h / scale)
    }
}

/// RANSAC configuration for homography fitting.
#[derive(Debug, Clone)]
pub struct RansacConfig {
    /// Maximum number of sampling iterations.
    pub max_iters: usize,
    /// Inlier threshold on reprojection error, in destination units (pixels).
    pub inlier_threshold: f64,
    /// Minimum number of inliers for the model to be accepted.
    pub min_inliers: usize,
    /// Seed for the sampling RNG, so fits are reproducible.
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 5.0,
            min_inliers: 6,
            seed: 0,
        }
    }
}

/// Result of a RANSAC homography fit.
#[derive(Debug, Clone)]
pub struct RansacFit {
    /// Homography refit on all inliers.
    pub h: Matrix3<f64>,
    /// `true` for correspondences consistent with `h`.
    pub inlier_mask: Vec<bool>,
    /// Number of `true` entries in `inlier_mask`.
    pub n_inliers: usize,
    /// RMS reprojection error over the inliers.
    pub rms_error: f64,
}

fn count_inliers(h: &Matrix3<f64>, src: &[[f64; 2]], dst: &[[f64; 2]], threshold: f64) -> Vec<bool> {
    src.iter()
        .zip(dst)
        .map(|(s, d)| reprojection_error(h, s, d) < threshold)
        .collect()
}

/// Fit a homography with RANSAC over minimal 4-point samples.
///
/// The best-supported model is refit with the DLT over all of its inliers.
pub fn fit_homography_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    config: &RansacConfig,
) -> HomographyResult<RansacFit> {
    if src.len() != dst.len() {
        return Err(HomographyError::Mismatched {
            src: src.len(),
            dst: dst.len(),
        });
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;

    for _ in 0..config.max_iters {
        let sample = rand::seq::index::sample(&mut rng, n, 4);
        let s4: Vec<[f64; 2]> = sample.iter().map(|i| src[i]).collect();
        let d4: Vec<[f64; 2]> = sample.iter().map(|i| dst[i]).collect();

        let Ok(h) = estimate_homography_dlt(&s4, &d4) else {
            continue;
        };

        let mask = count_inliers(&h, src, dst, config.inlier_threshold);
        let count = mask.iter().filter(|&&m| m).count();

        let improves = match &best {
            Some((_, _, best_count)) => count > *best_count,
            None => true,
        };
        if improves {
            let all_in = count == n;
            best = Some((h, mask, count));
            if all_in {
                break;
            }
        }
    }

    let (best_h, best_mask, best_count) = best.ok_or_else(|| {
        HomographyError::NumericalFailure("no non-degenerate sample found".into())
    })?;

    if best_count < config.min_inliers {
        return Err(HomographyError::InsufficientInliers {
            needed: config.min_inliers,
            found: best_count,
        });
    }

    let (inlier_src, inlier_dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = src
        .iter()
        .zip(dst)
        .zip(&best_mask)
        .filter(|(_, &m)| m)
        .map(|((s, d), _)| (*s, *d))
        .unzip();

    let h = estimate_homography_dlt(&inlier_src, &inlier_dst).unwrap_or(best_h);
    let inlier_mask = count_inliers(&h, src, dst, config.inlier_threshold);
    let n_inliers = inlier_mask.iter().filter(|&&m| m).count();

    let (final_src, final_dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = src
        .iter()
        .zip(dst)
        .zip(&inlier_mask)
        .filter(|(_, &m)| m)
        .map(|((s, d), _)| (*s, *d))
        .unzip();
    let rms = rms_error(&h, &final_src, &final_dst);

    trace!("RANSAC homography: {n_inliers}/{n} inliers, rms={rms:.4}");

    Ok(RansacFit {
        h,
        inlier_mask,
        n_inliers,
        rms_error: rms,
    })
}
