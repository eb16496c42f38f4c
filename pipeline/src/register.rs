use nalgebra::{Matrix3, Vector3};
use tracing::debug;

use mri_recon_volume::Volume;
use mri_recon_volume::filter::gaussian_smooth_mm;
use mri_recon_volume::resample::{Interpolation, resample_to_spacing};

use crate::progress::ProgressLog;

const STAGE: &str = "register";

/// Joint-histogram bins for the mutual-information metric.
const MI_BINS: usize = 32;

/// Regular-step gradient descent parameters (start step, minimum step,
/// iteration cap), as in the production registration setup.
const STEP_START: f64 = 4.0;
const STEP_MIN: f64 = 1e-3;
const MAX_ITERATIONS: usize = 200;

/// Multi-resolution schedule: shrink factors with matching smoothing sigmas.
const SHRINK_FACTORS: [f64; 3] = [4.0, 2.0, 1.0];
const SMOOTHING_SIGMAS_MM: [f64; 3] = [2.0, 1.0, 0.0];

/// Rigid transform: rotation (Euler xyz, radians) about `center` plus a
/// translation, mapping fixed-frame points into the moving frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct RigidTransform {
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
    pub center: [f64; 3],
}

impl RigidTransform {
    fn matrix(&self) -> Matrix3<f64> {
        let (sx, cx) = self.rotation[0].sin_cos();
        let (sy, cy) = self.rotation[1].sin_cos();
        let (sz, cz) = self.rotation[2].sin_cos();
        let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, -sx, 0.0, sx, cx);
        let ry = Matrix3::new(cy, 0.0, sy, 0.0, 1.0, 0.0, -sy, 0.0, cy);
        let rz = Matrix3::new(cz, -sz, 0.0, sz, cz, 0.0, 0.0, 0.0, 1.0);
        rz * ry * rx
    }

    /// Applies the transform to a fixed-frame point (mm).
    pub fn apply(&self, p: Vector3<f64>) -> Vector3<f64> {
        let c = Vector3::from_row_slice(&self.center);
        let t = Vector3::from_row_slice(&self.translation);
        self.matrix() * (p - c) + c + t
    }
}

/// Patient-frame center of a canonical volume (mm).
fn volume_center(v: &Volume) -> Vector3<f64> {
    let d = v.geometry.dims;
    v.geometry.index_to_patient([
        (d[0] - 1) as f64 / 2.0,
        (d[1] - 1) as f64 / 2.0,
        (d[2] - 1) as f64 / 2.0,
    ])
}

/// Samples the moving volume at a patient point with linear interpolation;
/// `None` outside the grid. Assumes a canonical (identity) direction.
fn sample_moving(moving: &Volume, p: Vector3<f64>) -> Option<f32> {
    let g = &moving.geometry;
    let idx = [
        (p[0] - g.origin[0]) / g.spacing[0],
        (p[1] - g.origin[1]) / g.spacing[1],
        (p[2] - g.origin[2]) / g.spacing[2],
    ];
    for a in 0..3 {
        if idx[a] < 0.0 || idx[a] > (g.dims[a] - 1) as f64 {
            return None;
        }
    }
    let base = [
        idx[0].floor() as usize,
        idx[1].floor() as usize,
        idx[2].floor() as usize,
    ];
    let frac = [
        idx[0] - base[0] as f64,
        idx[1] - base[1] as f64,
        idx[2] - base[2] as f64,
    ];
    let clamp = |v: usize, n: usize| v.min(n - 1);
    let mut acc = 0.0f64;
    for dz in 0..2 {
        let wz = if dz == 0 { 1.0 - frac[2] } else { frac[2] };
        for dy in 0..2 {
            let wy = if dy == 0 { 1.0 - frac[1] } else { frac[1] };
            for dx in 0..2 {
                let wx = if dx == 0 { 1.0 - frac[0] } else { frac[0] };
                let x = clamp(base[0] + dx, g.dims[0]);
                let y = clamp(base[1] + dy, g.dims[1]);
                let z = clamp(base[2] + dz, g.dims[2]);
                acc += wx * wy * wz * f64::from(moving.data[[z, y, x]]);
            }
        }
    }
    Some(acc as f32)
}

/// Mattes-style mutual information over a strided voxel sample of the fixed
/// volume. Higher is better.
fn mutual_information(fixed: &Volume, moving: &Volume, transform: &RigidTransform) -> f64 {
    let (f_lo, f_hi) = fixed.min_max();
    let (m_lo, m_hi) = moving.min_max();
    let f_range = (f_hi - f_lo).max(1e-6);
    let m_range = (m_hi - m_lo).max(1e-6);

    let mut joint = vec![0.0f64; MI_BINS * MI_BINS];
    let mut total = 0.0f64;
    let d = fixed.geometry.dims;
    // Stride keeps the sample around 32^3 regardless of volume size.
    let stride = [
        (d[0] / 32).max(1),
        (d[1] / 32).max(1),
        (d[2] / 32).max(1),
    ];
    let mut z = 0;
    while z < d[2] {
        let mut y = 0;
        while y < d[1] {
            let mut x = 0;
            while x < d[0] {
                let fv = fixed.data[[z, y, x]];
                let p = fixed
                    .geometry
                    .index_to_patient([x as f64, y as f64, z as f64]);
                if let Some(mv) = sample_moving(moving, transform.apply(p)) {
                    let fb = (((fv - f_lo) / f_range) * (MI_BINS - 1) as f32) as usize;
                    let mb = (((mv - m_lo) / m_range) * (MI_BINS - 1) as f32) as usize;
                    joint[fb.min(MI_BINS - 1) * MI_BINS + mb.min(MI_BINS - 1)] += 1.0;
                    total += 1.0;
                }
                x += stride[0];
            }
            y += stride[1];
        }
        z += stride[2];
    }
    if total < 64.0 {
        return 0.0; // almost no overlap
    }
    let mut pf = vec![0.0f64; MI_BINS];
    let mut pm = vec![0.0f64; MI_BINS];
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let p = joint[i * MI_BINS + j] / total;
            pf[i] += p;
            pm[j] += p;
        }
    }
    let mut mi = 0.0f64;
    for i in 0..MI_BINS {
        for j in 0..MI_BINS {
            let p = joint[i * MI_BINS + j] / total;
            if p > 0.0 && pf[i] > 0.0 && pm[j] > 0.0 {
                mi += p * (p / (pf[i] * pm[j])).ln();
            }
        }
    }
    mi
}

/// Parameter step scales: rotations move in small angles, translations in mm.
const PARAM_SCALES: [f64; 6] = [0.01, 0.01, 0.01, 1.0, 1.0, 1.0];

fn params_of(t: &RigidTransform) -> [f64; 6] {
    [
        t.rotation[0],
        t.rotation[1],
        t.rotation[2],
        t.translation[0],
        t.translation[1],
        t.translation[2],
    ]
}

fn transform_of(params: [f64; 6], center: [f64; 3]) -> RigidTransform {
    RigidTransform {
        rotation: [params[0], params[1], params[2]],
        translation: [params[3], params[4], params[5]],
        center,
    }
}

/// One resolution level of regular-step gradient ascent on the MI metric.
fn optimize_level(
    fixed: &Volume,
    moving: &Volume,
    start: RigidTransform,
    iterations: usize,
) -> RigidTransform {
    let center = start.center;
    let mut params = params_of(&start);
    let mut step = STEP_START;
    let mut value = mutual_information(fixed, moving, &start);
    let mut iteration = 0;
    while step > STEP_MIN && iteration < iterations {
        iteration += 1;
        // Numerical gradient, scaled per parameter.
        let mut gradient = [0.0f64; 6];
        let mut norm = 0.0f64;
        for k in 0..6 {
            let h = PARAM_SCALES[k] * 0.1;
            let mut plus = params;
            plus[k] += h;
            let mut minus = params;
            minus[k] -= h;
            let vp = mutual_information(fixed, moving, &transform_of(plus, center));
            let vm = mutual_information(fixed, moving, &transform_of(minus, center));
            gradient[k] = (vp - vm) / (2.0 * h);
            norm += gradient[k] * gradient[k];
        }
        let norm = norm.sqrt();
        if norm < 1e-12 {
            break;
        }
        let mut next = params;
        for k in 0..6 {
            next[k] += step * PARAM_SCALES[k] * gradient[k] / norm;
        }
        let next_value = mutual_information(fixed, moving, &transform_of(next, center));
        if next_value > value {
            params = next;
            value = next_value;
        } else {
            step /= 2.0;
        }
    }
    debug!("Registration level converged: MI {value:.4} after {iteration} iteration(s)");
    transform_of(params, center)
}

/// Shrinks and smooths a volume for one pyramid level.
fn pyramid_level(v: &Volume, shrink: f64, sigma_mm: f64) -> Volume {
    let smoothed = if sigma_mm > 0.0 {
        gaussian_smooth_mm(v, [sigma_mm; 3])
    } else {
        v.clone()
    };
    if shrink <= 1.0 {
        return smoothed;
    }
    let s = smoothed.geometry.spacing;
    resample_to_spacing(
        &smoothed,
        [s[0] * shrink, s[1] * shrink, s[2] * shrink],
        Interpolation::Linear,
    )
}

/// Rigidly registers `moving` to `fixed` with Mattes mutual information,
/// centered initialization, regular-step gradient optimization and a
/// three-level multi-resolution pyramid, then resamples onto the fixed grid
/// with a cubic interpolator.
pub fn rigid_register(fixed: &Volume, moving: &Volume, log: &mut ProgressLog) -> Volume {
    // Centered initialization: align geometric centers.
    let fc = volume_center(fixed);
    let mc = volume_center(moving);
    let mut transform = RigidTransform {
        rotation: [0.0; 3],
        translation: [mc[0] - fc[0], mc[1] - fc[1], mc[2] - fc[2]],
        center: [fc[0], fc[1], fc[2]],
    };
    for (level, (&shrink, &sigma)) in SHRINK_FACTORS
        .iter()
        .zip(SMOOTHING_SIGMAS_MM.iter())
        .enumerate()
    {
        let f = pyramid_level(fixed, shrink, sigma);
        let m = pyramid_level(moving, shrink, sigma);
        transform = optimize_level(&f, &m, transform, MAX_ITERATIONS / SHRINK_FACTORS.len());
        debug!(
            "Level {level} (shrink {shrink}): rotation {:?}, translation {:?}",
            transform.rotation, transform.translation
        );
    }
    log.info(
        STAGE,
        format!(
            "rigid registration: rotation {:?} rad, translation {:?} mm",
            transform.rotation, transform.translation
        ),
    );

    // Final resample onto the fixed grid with a smooth interpolator.
    let g = fixed.geometry.clone();
    let mut data = ndarray::Array3::<f32>::zeros((g.dims[2], g.dims[1], g.dims[0]));
    for z in 0..g.dims[2] {
        for y in 0..g.dims[1] {
            for x in 0..g.dims[0] {
                let p = g.index_to_patient([x as f64, y as f64, z as f64]);
                let q = transform.apply(p);
                let idx = [
                    (q[0] - moving.geometry.origin[0]) / moving.geometry.spacing[0],
                    (q[1] - moving.geometry.origin[1]) / moving.geometry.spacing[1],
                    (q[2] - moving.geometry.origin[2]) / moving.geometry.spacing[2],
                ];
                data[[z, y, x]] = sample_cubic_clamped(moving, idx);
            }
        }
    }
    Volume { geometry: g, data }
}

fn sample_cubic_clamped(v: &Volume, idx: [f64; 3]) -> f32 {
    let g = &v.geometry;
    for a in 0..3 {
        if idx[a] < -0.5 || idx[a] > (g.dims[a] as f64) - 0.5 {
            return 0.0;
        }
    }
    // Catmull-Rom per axis with clamped taps.
    let weights = |t: f64| -> [f64; 4] {
        let t2 = t * t;
        let t3 = t2 * t;
        [
            0.5 * (-t3 + 2.0 * t2 - t),
            0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
            0.5 * (-3.0 * t3 + 4.0 * t2 + t),
            0.5 * (t3 - t2),
        ]
    };
    let mut base = [0i64; 3];
    let mut w = [[0.0f64; 4]; 3];
    for a in 0..3 {
        let f = idx[a].floor();
        base[a] = f as i64 - 1;
        w[a] = weights(idx[a] - f);
    }
    let clamp = |i: i64, n: usize| i.clamp(0, n as i64 - 1) as usize;
    let mut acc = 0.0f64;
    for (kz, &wz) in w[2].iter().enumerate() {
        let z = clamp(base[2] + kz as i64, g.dims[2]);
        for (ky, &wy) in w[1].iter().enumerate() {
            let y = clamp(base[1] + ky as i64, g.dims[1]);
            for (kx, &wx) in w[0].iter().enumerate() {
                let x = clamp(base[0] + kx as i64, g.dims[0]);
                acc += wz * wy * wx * f64::from(v.data[[z, y, x]]);
            }
        }
    }
    acc as f32
}

/// Fuses registered volumes by per-voxel maximum onto the first volume's
/// grid. Max fusion preserves hyperintense structure from every plane.
pub fn fuse_max(volumes: Vec<Volume>, log: &mut ProgressLog) -> Volume {
    let mut iter = volumes.into_iter();
    let mut out = iter.next().expect("fuse_max needs at least one volume");
    let mut fused = 1usize;
    for v in iter {
        // Grids match after registration resampled onto the reference.
        ndarray::Zip::from(&mut out.data).and(&v.data).for_each(|o, &x| {
            if x > *o {
                *o = x;
            }
        });
        fused += 1;
        // v drops here; intermediates are released between pairwise fusions.
    }
    log.info(STAGE, format!("max-fused {fused} volume(s)"));
    out
}
