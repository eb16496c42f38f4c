use ndarray::Array3;
use tracing::debug;

use crate::geometry::{Geometry, Mask, Volume};

/// Interpolation used when resampling scalar volumes and masks.
///
/// Masks must only ever be resampled with `Nearest`; intensities use `Linear`
/// during registration search and `Cubic` everywhere a smooth interpolator is
/// required.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Linear,
    Cubic,
}

fn new_dims(dims: [usize; 3], spacing: [f64; 3], target: [f64; 3]) -> [usize; 3] {
    let mut out = [0usize; 3];
    for a in 0..3 {
        out[a] = ((dims[a] as f64 * spacing[a] / target[a]).round() as usize).max(1);
    }
    out
}

fn clamp_index(i: i64, n: usize) -> usize {
    i.clamp(0, n as i64 - 1) as usize
}

fn sample_nearest(data: &Array3<f32>, dims: [usize; 3], p: [f64; 3]) -> f32 {
    let x = clamp_index(p[0].round() as i64, dims[0]);
    let y = clamp_index(p[1].round() as i64, dims[1]);
    let z = clamp_index(p[2].round() as i64, dims[2]);
    data[[z, y, x]]
}

fn sample_linear(data: &Array3<f32>, dims: [usize; 3], p: [f64; 3]) -> f32 {
    let mut base = [0i64; 3];
    let mut frac = [0.0f64; 3];
    for a in 0..3 {
        let f = p[a].floor();
        base[a] = f as i64;
        frac[a] = p[a] - f;
    }
    let mut acc = 0.0f64;
    for dz in 0..2i64 {
        let wz = if dz == 0 { 1.0 - frac[2] } else { frac[2] };
        let z = clamp_index(base[2] + dz, dims[2]);
        for dy in 0..2i64 {
            let wy = if dy == 0 { 1.0 - frac[1] } else { frac[1] };
            let y = clamp_index(base[1] + dy, dims[1]);
            for dx in 0..2i64 {
                let wx = if dx == 0 { 1.0 - frac[0] } else { frac[0] };
                let x = clamp_index(base[0] + dx, dims[0]);
                acc += wz * wy * wx * f64::from(data[[z, y, x]]);
            }
        }
    }
    acc as f32
}

/// Catmull-Rom weights for a fractional offset `t` in [0, 1).
fn cubic_weights(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        0.5 * (-t3 + 2.0 * t2 - t),
        0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
        0.5 * (-3.0 * t3 + 4.0 * t2 + t),
        0.5 * (t3 - t2),
    ]
}

fn sample_cubic(data: &Array3<f32>, dims: [usize; 3], p: [f64; 3]) -> f32 {
    let mut base = [0i64; 3];
    let mut w = [[0.0f64; 4]; 3];
    for a in 0..3 {
        let f = p[a].floor();
        base[a] = f as i64 - 1;
        w[a] = cubic_weights(p[a] - f);
    }
    let mut acc = 0.0f64;
    for (kz, &wz) in w[2].iter().enumerate() {
        let z = clamp_index(base[2] + kz as i64, dims[2]);
        for (ky, &wy) in w[1].iter().enumerate() {
            let y = clamp_index(base[1] + ky as i64, dims[1]);
            for (kx, &wx) in w[0].iter().enumerate() {
                let x = clamp_index(base[0] + kx as i64, dims[0]);
                acc += wz * wy * wx * f64::from(data[[z, y, x]]);
            }
        }
    }
    acc as f32
}

fn resample_array(
    data: &Array3<f32>,
    dims: [usize; 3],
    spacing: [f64; 3],
    target: [f64; 3],
    dims_out: [usize; 3],
    interpolation: Interpolation,
) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros((dims_out[2], dims_out[1], dims_out[0]));
    for z in 0..dims_out[2] {
        for y in 0..dims_out[1] {
            for x in 0..dims_out[0] {
                let p = [
                    x as f64 * target[0] / spacing[0],
                    y as f64 * target[1] / spacing[1],
                    z as f64 * target[2] / spacing[2],
                ];
                out[[z, y, x]] = match interpolation {
                    Interpolation::Nearest => sample_nearest(data, dims, p),
                    Interpolation::Linear => sample_linear(data, dims, p),
                    Interpolation::Cubic => sample_cubic(data, dims, p),
                };
            }
        }
    }
    out
}

/// Resamples a volume onto a grid with the given spacing, preserving origin
/// and direction.
///
/// When the target equals the current spacing the input is returned unchanged,
/// so resampling to the native spacing is exactly the identity.
pub fn resample_to_spacing(
    volume: &Volume,
    target: [f64; 3],
    interpolation: Interpolation,
) -> Volume {
    if volume.geometry.spacing == target {
        return volume.clone();
    }
    let dims = volume.geometry.dims;
    let spacing = volume.geometry.spacing;
    let dims_out = new_dims(dims, spacing, target);
    debug!(
        "Resampling {:?} @ {:?} mm -> {:?} @ {:?} mm ({:?})",
        dims, spacing, dims_out, target, interpolation
    );
    let data = resample_array(&volume.data, dims, spacing, target, dims_out, interpolation);
    Volume {
        geometry: Geometry {
            dims: dims_out,
            spacing: target,
            origin: volume.geometry.origin,
            direction: volume.geometry.direction,
        },
        data,
    }
}

/// Nearest-neighbour resampling of a binary mask; masks are never interpolated.
pub fn resample_mask_to_spacing(mask: &Mask, target: [f64; 3]) -> Mask {
    if mask.geometry.spacing == target {
        return mask.clone();
    }
    let dims = mask.geometry.dims;
    let spacing = mask.geometry.spacing;
    let dims_out = new_dims(dims, spacing, target);
    let mut data = Array3::<u8>::zeros((dims_out[2], dims_out[1], dims_out[0]));
    for z in 0..dims_out[2] {
        for y in 0..dims_out[1] {
            for x in 0..dims_out[0] {
                let xi = clamp_index((x as f64 * target[0] / spacing[0]).round() as i64, dims[0]);
                let yi = clamp_index((y as f64 * target[1] / spacing[1]).round() as i64, dims[1]);
                let zi = clamp_index((z as f64 * target[2] / spacing[2]).round() as i64, dims[2]);
                data[[z, y, x]] = mask.data[[zi, yi, xi]];
            }
        }
    }
    Mask {
        geometry: Geometry {
            dims: dims_out,
            spacing: target,
            origin: mask.geometry.origin,
            direction: mask.geometry.direction,
        },
        data,
    }
}

/// Crops a mask to the half-open index box `[lo, hi)` given in `(x, y, z)`
/// order, shifting the origin to the patient position of `lo`.
pub fn crop_mask(mask: &Mask, lo: [usize; 3], hi: [usize; 3]) -> Mask {
    let dims = [hi[0] - lo[0], hi[1] - lo[1], hi[2] - lo[2]];
    let origin = mask
        .geometry
        .index_to_patient([lo[0] as f64, lo[1] as f64, lo[2] as f64]);
    let geometry = Geometry {
        dims,
        spacing: mask.geometry.spacing,
        origin,
        direction: mask.geometry.direction,
    };
    let data = mask
        .data
        .slice(ndarray::s![lo[2]..hi[2], lo[1]..hi[1], lo[0]..hi[0]])
        .to_owned();
    Mask { geometry, data }
}

/// Crops a mask to its foreground bounding box plus a physical margin,
/// removing empty background slabs before surface extraction. An empty mask
/// is returned unchanged.
pub fn crop_mask_to_content(mask: &Mask, margin_mm: f64) -> Mask {
    let Some((lo, hi)) = mask.bounding_box() else {
        return mask.clone();
    };
    let mut lo_m = [0usize; 3];
    let mut hi_m = [0usize; 3];
    for a in 0..3 {
        let margin = (margin_mm / mask.geometry.spacing[a]).ceil() as usize;
        lo_m[a] = lo[a].saturating_sub(margin);
        hi_m[a] = (hi[a] + 1 + margin).min(mask.geometry.dims[a]);
    }
    crop_mask(mask, lo_m, hi_m)
}
