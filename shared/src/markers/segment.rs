//! Thresholding and connected-component labelling for fiducial candidates.

use ndarray::ArrayView2;

/// Otsu's threshold over an 8-bit image.
///
/// Maximizes the between-class variance of the dark and bright populations.
/// Pixels `<=` the returned value belong to the dark class.
pub fn otsu_threshold(image: ArrayView2<u8>) -> u8 {
    let mut histogram = [0u64; 256];
    for &px in image.iter() {
        histogram[px as usize] += 1;
    }

    let total = image.len() as f64;
    if total == 0.0 {
        return 127;
    }
    let total_mean: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum::<f64>()
        / total;

    let mut cum_count = 0u64;
    let mut cum_sum = 0.0;
    let mut best_threshold = 0u8;
    let mut max_variance = -1.0;

    for t in 0..255usize {
        cum_count += histogram[t];
        cum_sum += t as f64 * histogram[t] as f64;

        let w_dark = cum_count as f64 / total;
        if w_dark == 0.0 || w_dark == 1.0 {
            continue;
        }
        let w_bright = 1.0 - w_dark;
        let mean_dark = cum_sum / cum_count as f64;
        let mean_bright = (total_mean * total - cum_sum) / (total - cum_count as f64);

        let variance = w_dark * w_bright * (mean_dark - mean_bright).powi(2);
        if variance > max_variance {
            max_variance = variance;
            best_threshold = t as u8;
        }
    }

    best_threshold
}

/// Pixel coordinates `(row, col)` of one 8-connected dark region.
#[derive(Debug, Clone)]
pub struct Component {
    pub pixels: Vec<(usize, usize)>,
}

impl Component {
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Centroid as `[x, y]` pixel coordinates.
    pub fn centroid(&self) -> [f64; 2] {
        let n = self.pixels.len().max(1) as f64;
        let (sx, sy) = self
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sx, sy), &(r, c)| (sx + c as f64, sy + r as f64));
        [sx / n, sy / n]
    }
}

/// Find 8-connected components of pixels `<= threshold`.
///
/// Components smaller than `min_pixels` are discarded.
pub fn dark_components(image: ArrayView2<u8>, threshold: u8, min_pixels: usize) -> Vec<Component> {
    let (rows, cols) = image.dim();
    let mut visited = vec![false; rows * cols];
    let mut components = Vec::new();

    const NEIGHBORS: [(isize, isize); 8] = [
        (-1, -1),
        (-1, 0),
        (-1, 1),
        (0, -1),
        (0, 1),
        (1, -1),
        (1, 0),
        (1, 1),
    ];

    for i in 0..rows {
        for j in 0..cols {
            if visited[i * cols + j] || image[[i, j]] > threshold {
                continue;
            }

            let mut pixels = Vec::new();
            let mut stack = vec![(i, j)];
            visited[i * cols + j] = true;

            while let Some((y, x)) = stack.pop() {
                pixels.push((y, x));

                for &(dy, dx) in &NEIGHBORS {
                    let ny = y as isize + dy;
                    let nx = x as isize + dx;
                    if ny < 0 || nx < 0 || ny >= rows as isize || nx >= cols as isize {
                        continue;
                    }
                    let (ny, nx) = (ny as usize, nx as usize);
                    let idx = ny * cols + nx;
                    if !visited[idx] && image[[ny, nx]] <= threshold {
                        visited[idx] = true;
                        stack.push((ny, nx));
                    }
                }
            }

            if pixels.len() >= min_pixels {
                components.push(Component { pixels });
            }
        }
    }

    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_otsu_bimodal() {
        let mut img = Array2::from_elem((10, 10), 200u8);
        img.slice_mut(ndarray::s![0..5, ..]).fill(20);
        let t = otsu_threshold(img.view());
        assert!((20..200).contains(&t), "threshold {t}");
    }

    #[test]
    fn test_components_are_separated() {
        let mut img = Array2::from_elem((20, 20), 255u8);
        img.slice_mut(ndarray::s![2..6, 2..6]).fill(0);
        img.slice_mut(ndarray::s![10..15, 10..12]).fill(0);
        img[[18, 18]] = 0;

        let comps = dark_components(img.view(), 128, 2);
        assert_eq!(comps.len(), 2);

        let mut sizes: Vec<usize> = comps.iter().map(|c| c.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![10, 16]);
    }

    #[test]
    fn test_diagonal_pixels_connect() {
        let mut img = Array2::from_elem((4, 4), 255u8);
        img[[0, 0]] = 0;
        img[[1, 1]] = 0;
        img[[2, 2]] = 0;

        let comps = dark_components(img.view(), 128, 1);
        assert_eq!(comps.len(), 1);
        let c = comps[0].centroid();
        assert!((c[0] - 1.0).abs() < 1e-12 && (c[1] - 1.0).abs() < 1e-12);
    }
}
