use ndarray::{Array2, Array3};

use crate::geometry::Volume;

/// Number of histogram bins used for Otsu thresholding.
const HISTOGRAM_BINS: usize = 256;

/// Builds a normalized 1D Gaussian kernel for a sigma given in voxels.
///
/// Radius covers three standard deviations. Returns `None` when the sigma is
/// too small to produce a kernel wider than a single sample.
fn gaussian_kernel(sigma_vox: f64) -> Option<Vec<f64>> {
    if sigma_vox < 0.3 {
        return None;
    }
    let radius = (3.0 * sigma_vox).ceil() as usize;
    let size = 2 * radius + 1;
    let two_sigma_sq = 2.0 * sigma_vox * sigma_vox;
    let mut kernel = Vec::with_capacity(size);
    for i in 0..size {
        let x = i as f64 - radius as f64;
        kernel.push((-x * x / two_sigma_sq).exp());
    }
    let sum: f64 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    Some(kernel)
}

/// One separable smoothing pass along `axis` (0 = x, 1 = y, 2 = z).
///
/// Border samples renormalize by the in-bounds kernel weight, so uniform
/// fields pass through unchanged.
fn smooth_axis(data: &Array3<f32>, dims: [usize; 3], axis: usize, kernel: &[f64]) -> Array3<f32> {
    let half = kernel.len() / 2;
    let mut out = data.clone();
    let [nx, ny, nz] = dims;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let mut sum = 0.0f64;
                let mut weight = 0.0f64;
                let along = [x, y, z][axis];
                let extent = dims[axis];
                for (k, &kval) in kernel.iter().enumerate() {
                    let i = along as isize + k as isize - half as isize;
                    if i < 0 || i as usize >= extent {
                        continue;
                    }
                    let mut idx = [x, y, z];
                    idx[axis] = i as usize;
                    sum += f64::from(data[[idx[2], idx[1], idx[0]]]) * kval;
                    weight += kval;
                }
                out[[z, y, x]] = (sum / weight) as f32;
            }
        }
    }
    out
}

/// Separable Gaussian smoothing with a per-axis sigma in millimetres.
///
/// Sigmas are converted to voxel units through the volume spacing, so the
/// physical smoothing scale is the same along anisotropic axes.
pub fn gaussian_smooth_mm(volume: &Volume, sigma_mm: [f64; 3]) -> Volume {
    let dims = volume.geometry.dims;
    let mut data = volume.data.clone();
    for axis in 0..3 {
        let sigma_vox = sigma_mm[axis] / volume.geometry.spacing[axis];
        if let Some(kernel) = gaussian_kernel(sigma_vox) {
            data = smooth_axis(&data, dims, axis, &kernel);
        }
    }
    Volume {
        geometry: volume.geometry.clone(),
        data,
    }
}

/// Gaussian smoothing with sigma given in voxels, ignoring spacing.
pub fn gaussian_smooth_vox(volume: &Volume, sigma_vox: f64) -> Volume {
    let dims = volume.geometry.dims;
    let mut data = volume.data.clone();
    if let Some(kernel) = gaussian_kernel(sigma_vox) {
        for axis in 0..3 {
            data = smooth_axis(&data, dims, axis, &kernel);
        }
    }
    Volume {
        geometry: volume.geometry.clone(),
        data,
    }
}

/// Gradient magnitude by central differences, in intensity per millimetre.
pub fn gradient_magnitude(volume: &Volume) -> Volume {
    let [nx, ny, nz] = volume.geometry.dims;
    let [sx, sy, sz] = volume.geometry.spacing;
    let data = &volume.data;
    let mut out = Array3::<f32>::zeros((nz, ny, nx));
    let diff = |hi: f32, lo: f32, step: f64| f64::from(hi - lo) / step;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let gx = diff(
                    data[[z, y, (x + 1).min(nx - 1)]],
                    data[[z, y, x.saturating_sub(1)]],
                    sx * if x == 0 || x == nx - 1 { 1.0 } else { 2.0 },
                );
                let gy = diff(
                    data[[z, (y + 1).min(ny - 1), x]],
                    data[[z, y.saturating_sub(1), x]],
                    sy * if y == 0 || y == ny - 1 { 1.0 } else { 2.0 },
                );
                let gz = diff(
                    data[[(z + 1).min(nz - 1), y, x]],
                    data[[z.saturating_sub(1), y, x]],
                    sz * if z == 0 || z == nz - 1 { 1.0 } else { 2.0 },
                );
                out[[z, y, x]] = ((gx * gx + gy * gy + gz * gz).sqrt()) as f32;
            }
        }
    }
    Volume {
        geometry: volume.geometry.clone(),
        data: out,
    }
}

/// 2D gradient magnitude of one slice, in intensity per millimetre.
pub fn gradient_magnitude_2d(slice: &Array2<f32>, spacing: [f64; 2]) -> Array2<f32> {
    let (ny, nx) = slice.dim();
    let mut out = Array2::<f32>::zeros((ny, nx));
    let diff = |hi: f32, lo: f32, step: f64| f64::from(hi - lo) / step;
    for y in 0..ny {
        for x in 0..nx {
            let gx = diff(
                slice[[y, (x + 1).min(nx - 1)]],
                slice[[y, x.saturating_sub(1)]],
                spacing[0] * if x == 0 || x == nx - 1 { 1.0 } else { 2.0 },
            );
            let gy = diff(
                slice[[(y + 1).min(ny - 1), x]],
                slice[[y.saturating_sub(1), x]],
                spacing[1] * if y == 0 || y == ny - 1 { 1.0 } else { 2.0 },
            );
            out[[y, x]] = ((gx * gx + gy * gy).sqrt()) as f32;
        }
    }
    out
}

/// Otsu's threshold over a 256-bin histogram.
///
/// Maximizes the inter-class variance; when several bins tie, the first and
/// last tied bins are averaged. Returns `None` when the value range is
/// degenerate (flat input).
pub fn otsu_threshold(values: impl Iterator<Item = f32> + Clone) -> Option<f32> {
    let mut lo = f32::MAX;
    let mut hi = f32::MIN;
    let mut n = 0usize;
    for v in values.clone() {
        lo = lo.min(v);
        hi = hi.max(v);
        n += 1;
    }
    if n == 0 || hi - lo <= 0.0 {
        return None;
    }
    let range = f64::from(hi - lo);
    let scale = (HISTOGRAM_BINS - 1) as f64 / range;
    let mut histogram = [0u64; HISTOGRAM_BINS];
    for v in values {
        let bin = ((f64::from(v - lo)) * scale) as usize;
        histogram[bin.min(HISTOGRAM_BINS - 1)] += 1;
    }

    let total = n as f64;
    let total_sum: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &count)| i as f64 * count as f64)
        .sum();

    let mut best_first = 0usize;
    let mut best_last = 0usize;
    let mut best_variance = 0.0f64;
    let mut bg_count = 0.0f64;
    let mut bg_sum = 0.0f64;
    for (t, &count) in histogram.iter().enumerate() {
        bg_count += count as f64;
        if bg_count == 0.0 {
            continue;
        }
        let fg_count = total - bg_count;
        if fg_count == 0.0 {
            break;
        }
        bg_sum += t as f64 * count as f64;
        let mean_bg = bg_sum / bg_count;
        let mean_fg = (total_sum - bg_sum) / fg_count;
        let d = mean_bg - mean_fg;
        let variance = bg_count * fg_count * d * d;
        if variance > best_variance {
            best_variance = variance;
            best_first = t;
            best_last = t;
        } else if (variance - best_variance).abs() < f64::EPSILON * best_variance.abs() {
            best_last = t;
        }
    }
    let best = (best_first + best_last) / 2;
    Some(lo + (best as f64 / scale) as f32)
}

/// The `p`-th percentile (0..=100) of the given samples, by linear rank.
pub fn percentile(samples: &mut Vec<f32>, p: f64) -> Option<f32> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(|a, b| a.total_cmp(b));
    let rank = (p / 100.0 * (samples.len() - 1) as f64).round() as usize;
    Some(samples[rank.min(samples.len() - 1)])
}
