use tracing::debug;

use mri_recon_volume::Volume;
use mri_recon_volume::filter::{gaussian_smooth_mm, otsu_threshold, percentile};
use mri_recon_volume::geometry::Mask;

use crate::error::{Error, Result};
use crate::progress::ProgressLog;

const STAGE: &str = "preprocess";

/// Bias-field smoothing scales in millimetres, coarse to fine.
const BIAS_LEVELS_MM: [f64; 3] = [64.0, 32.0, 16.0];

/// Intensity window percentiles.
const WINDOW_LO: f64 = 1.0;
const WINDOW_HI: f64 = 99.0;

/// Multiplicative bias-field correction restricted to a coarse body mask.
///
/// The field is estimated per level by normalized convolution (Gaussian blur
/// of masked intensity over a blur of the mask indicator) and divided out,
/// the multi-level coarse-to-fine scheme an N4 corrector applies. Returns an
/// error when the body mask or field estimate degenerates; the caller falls
/// back to the uncorrected volume.
pub fn bias_correct(volume: &Volume) -> Result<Volume> {
    let threshold = otsu_threshold(volume.data.iter().copied())
        .ok_or_else(|| Error::DegenerateGeometry("flat intensities, no body mask".into()))?;
    let body = Mask::from_threshold(volume, threshold);
    if body.is_empty() {
        return Err(Error::DegenerateGeometry(
            "empty body mask for bias estimation".into(),
        ));
    }

    let mut corrected = volume.clone();
    for level_sigma in BIAS_LEVELS_MM {
        // Cap the smoothing scale to a quarter of each axis extent so small
        // fields of view still see a spatially varying estimate.
        let mut sigma = [level_sigma; 3];
        for a in 0..3 {
            let extent = volume.geometry.dims[a] as f64 * volume.geometry.spacing[a];
            sigma[a] = sigma[a].min(extent / 4.0);
        }
        let mut masked = corrected.clone();
        let mut indicator = corrected.clone();
        ndarray::Zip::from(&mut masked.data)
            .and(&mut indicator.data)
            .and(&body.data)
            .for_each(|m, i, &b| {
                if b == 0 {
                    *m = 0.0;
                    *i = 0.0;
                } else {
                    *i = 1.0;
                }
            });
        let blurred_values = gaussian_smooth_mm(&masked, sigma);
        let blurred_mask = gaussian_smooth_mm(&indicator, sigma);

        // Mean field value inside the body, for gain normalization.
        let mut field_sum = 0.0f64;
        let mut field_count = 0usize;
        let mut field = corrected.clone();
        ndarray::Zip::from(&mut field.data)
            .and(&blurred_values.data)
            .and(&blurred_mask.data)
            .for_each(|f, &v, &w| {
                *f = if w > 1e-4 { v / w } else { 0.0 };
            });
        ndarray::Zip::from(&field.data).and(&body.data).for_each(|&f, &b| {
            if b != 0 && f > 0.0 {
                field_sum += f64::from(f);
                field_count += 1;
            }
        });
        if field_count == 0 {
            return Err(Error::DegenerateGeometry(
                "bias field estimate vanished".into(),
            ));
        }
        let mean_field = (field_sum / field_count as f64) as f32;
        if mean_field <= 0.0 {
            return Err(Error::DegenerateGeometry("non-positive bias field".into()));
        }
        ndarray::Zip::from(&mut corrected.data)
            .and(&field.data)
            .for_each(|v, &f| {
                if f > 1e-4 {
                    *v *= mean_field / f;
                }
            });
        debug!("Bias level sigma {sigma:?} mm: mean field {mean_field:.4}");
    }
    Ok(corrected)
}

/// Clips to the 1st-99th percentile and rescales to [0, 1].
pub fn window(volume: &Volume) -> Result<Volume> {
    let mut samples: Vec<f32> = volume.data.iter().copied().collect();
    let lo = percentile(&mut samples, WINDOW_LO)
        .ok_or_else(|| Error::DegenerateGeometry("empty volume".into()))?;
    let hi = percentile(&mut samples, WINDOW_HI)
        .ok_or_else(|| Error::DegenerateGeometry("empty volume".into()))?;
    if hi - lo <= 0.0 {
        return Err(Error::DegenerateGeometry(
            "flat intensity window (all-equal voxels)".into(),
        ));
    }
    let range = hi - lo;
    let mut out = volume.clone();
    out.data.mapv_inplace(|v| ((v - lo) / range).clamp(0.0, 1.0));
    Ok(out)
}

/// Edge-budget smoothing: Gaussian with a physical sigma near the mean
/// in-plane spacing, strengthened when through-plane spacing dominates.
pub fn smooth(volume: &Volume) -> Volume {
    let mean_in_plane = volume.geometry.mean_in_plane_spacing();
    let mut sigma = mean_in_plane;
    if volume.geometry.spacing[2] > 2.0 * mean_in_plane {
        sigma *= 1.5;
    }
    gaussian_smooth_mm(volume, [sigma; 3])
}

/// Full intensity preprocessing: bias correction (recoverable, skippable via
/// config), windowing, smoothing. Geometry is untouched throughout.
pub fn preprocess(
    volume: &Volume,
    config: &crate::config::PipelineConfig,
    log: &mut ProgressLog,
) -> Result<Volume> {
    let corrected = if !config.bias_correction {
        log.info(STAGE, "bias-field correction disabled by configuration");
        volume.clone()
    } else {
        match bias_correct(volume) {
            Ok(v) => {
                log.info(STAGE, "bias-field correction applied");
                v
            }
            Err(e) => {
                log.recoverable(
                    STAGE,
                    format!("bias correction failed ({e}), using uncorrected volume"),
                );
                volume.clone()
            }
        }
    };
    let windowed = window(&corrected)?;
    let smoothed = smooth(&windowed);
    debug_assert!(smoothed.geometry.approx_eq(&volume.geometry, 1e-9));
    log.info(
        STAGE,
        format!(
            "windowed to [{WINDOW_LO}, {WINDOW_HI}] percentile and smoothed ({:?} voxels)",
            smoothed.geometry.dims
        ),
    );
    Ok(smoothed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use mri_recon_volume::{Geometry, VolumeBuilder};
    use nalgebra::{Matrix3, Vector3};
    use ndarray::Array3;

    fn volume_with(dims: [usize; 3], f: impl Fn(usize, usize, usize) -> f32) -> Volume {
        let mut data = Array3::<f32>::zeros((dims[2], dims[1], dims[0]));
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    data[[z, y, x]] = f(x, y, z);
                }
            }
        }
        VolumeBuilder::default()
            .geometry(Geometry {
                dims,
                spacing: [1.0; 3],
                origin: Vector3::zeros(),
                direction: Matrix3::identity(),
            })
            .data(data)
            .build()
            .unwrap()
    }

    #[test]
    fn window_rescales_to_unit_range() {
        let v = volume_with([8, 8, 8], |x, _, _| 100.0 + x as f32 * 10.0);
        let w = window(&v).unwrap();
        let (lo, hi) = w.min_max();
        assert!(lo >= 0.0 && hi <= 1.0);
        assert!(hi > 0.9);
    }

    #[test]
    fn window_rejects_flat_volume() {
        let v = volume_with([4, 4, 4], |_, _, _| 7.0);
        assert!(window(&v).is_err());
    }

    #[test]
    fn bias_correction_flattens_gain_gradient() {
        // Bright object with a multiplicative left-right gain ramp.
        let v = volume_with([24, 24, 24], |x, y, z| {
            let inside = (4..20).contains(&x) && (4..20).contains(&y) && (4..20).contains(&z);
            if inside {
                let gain = 1.0 + 0.6 * (x as f32 / 23.0);
                200.0 * gain
            } else {
                5.0
            }
        });
        let corrected = bias_correct(&v).unwrap();
        // Compare far-left vs far-right object means before and after.
        let object_mean = |vol: &Volume, xs: std::ops::Range<usize>| -> f32 {
            let mut sum = 0.0;
            let mut n = 0;
            for z in 4..20 {
                for y in 4..20 {
                    for x in xs.clone() {
                        sum += vol.data[[z, y, x]];
                        n += 1;
                    }
                }
            }
            sum / n as f32
        };
        let before = object_mean(&v, 16..20) / object_mean(&v, 4..8);
        let after = object_mean(&corrected, 16..20) / object_mean(&corrected, 4..8);
        assert!(
            (after - 1.0).abs() < (before - 1.0).abs(),
            "gain ratio {before:.3} -> {after:.3} did not flatten"
        );
    }

    #[test]
    fn bias_correction_rejects_flat_volume() {
        let v = volume_with([6, 6, 6], |_, _, _| 3.0);
        assert!(bias_correct(&v).is_err());
    }

    #[test]
    fn preprocess_recovers_from_bias_failure() {
        // Two-level volume where windowing works but Otsu-based bias
        // estimation still succeeds; force failure via flat data instead.
        let v = volume_with([6, 6, 6], |x, _, _| if x < 3 { 0.0 } else { 0.0 });
        let mut log = ProgressLog::new();
        // Flat volume: bias fails (recoverable), window fails (fatal).
        assert!(preprocess(&v, &PipelineConfig::default(), &mut log).is_err());
        assert!(log.has_recoverable());
    }

    #[test]
    fn preprocess_keeps_geometry() {
        let v = volume_with([10, 10, 10], |x, y, z| (x + 2 * y + 3 * z) as f32);
        let mut log = ProgressLog::new();
        let p = preprocess(&v, &PipelineConfig::default(), &mut log).unwrap();
        assert!(p.geometry.approx_eq(&v.geometry, 1e-12));
        let (lo, hi) = p.min_max();
        assert!((0.0..=1.0).contains(&lo));
        assert!((0.0..=1.0).contains(&hi));
    }
}
