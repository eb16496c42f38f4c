use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;
use tracing::debug;

use mri_recon_volume::resample::{Interpolation, resample_to_spacing};
use mri_recon_volume::{Geometry, Volume, VolumeBuilder, reorient_to_canonical};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::inspect::SeriesStack;
use crate::progress::ProgressLog;

const STAGE: &str = "assemble";

/// Relative deviation from the median slice gap above which a slice is
/// dropped as an outlier.
const OUTLIER_TOLERANCE: f64 = 0.2;

/// Coefficient of variation of slice gaps above which quality is flagged.
const CV_WARNING: f64 = 0.1;

/// Through-plane spacing (mm) at or above which the acquisition is treated
/// as a 2D stack: no isotropic intensity resample, slice-wise segmentation.
pub const THICK_STACK_MM: f64 = 3.0;

/// Anisotropy ratio above which native spacing is abandoned.
const RESAMPLE_RATIO: f64 = 1.5;

/// Which segmentation branch the assembled volume routes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentationRoute {
    ThreeD,
    TwoPointFiveD,
}

/// A canonicalized volume plus the routing facts later stages depend on.
#[derive(Debug)]
pub struct AssembledVolume {
    pub volume: Volume,
    pub route: SegmentationRoute,
    /// Through-plane over mean in-plane spacing, before any resampling.
    pub anisotropy_ratio: f64,
    /// Native through-plane spacing in millimetres.
    pub native_z: f64,
}

/// Sorted slice order plus the median gap along the stack normal.
struct Ordering {
    indices: Vec<usize>,
    median_gap: Option<f64>,
}

fn order_slices(stack: &SeriesStack, log: &mut ProgressLog) -> Ordering {
    let normal = stack.normal();
    let with_positions = normal.is_some()
        && stack.slices.iter().filter(|s| s.position.is_some()).count() >= stack.len();
    if !with_positions {
        log.quality_warning(
            STAGE,
            "missing orientation or positions, ordering by instance index",
        );
        let mut indices: Vec<usize> = (0..stack.len()).collect();
        indices.sort_by_key(|&i| (stack.slices[i].instance_number, i));
        return Ordering {
            indices,
            median_gap: None,
        };
    }
    let n = normal.unwrap();
    let projection =
        |i: usize| -> f64 { n.dot(stack.slices[i].position.as_ref().unwrap()) };

    // Non-monotone positions in acquisition order point at a shuffled or
    // mixed stack even when sorting will repair the order.
    let mut acquisition: Vec<usize> = (0..stack.len()).collect();
    acquisition.sort_by_key(|&i| (stack.slices[i].instance_number, i));
    let non_monotone = acquisition
        .windows(2)
        .filter(|w| projection(w[1]) <= projection(w[0]))
        .count();
    if stack.len() > 2 && non_monotone * 10 > stack.len() {
        log.quality_warning(
            STAGE,
            format!(
                "{non_monotone}/{} non-monotone slice positions in acquisition order",
                stack.len()
            ),
        );
    }

    let mut indices: Vec<usize> = (0..stack.len()).collect();
    indices.sort_by(|&a, &b| projection(a).total_cmp(&projection(b)));

    if indices.len() <= 2 {
        return Ordering {
            indices,
            median_gap: None,
        };
    }

    let mut deltas: Vec<f64> = indices
        .windows(2)
        .map(|w| projection(w[1]) - projection(w[0]))
        .collect();
    let mut sorted = deltas.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = sorted[sorted.len() / 2];
    if median <= 0.0 {
        log.quality_warning(STAGE, "duplicate slice positions, keeping raw order");
        return Ordering {
            indices,
            median_gap: None,
        };
    }
    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    let variance =
        deltas.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / deltas.len() as f64;
    let cv = variance.sqrt() / median;
    if cv > CV_WARNING {
        log.quality_warning(
            STAGE,
            format!("slice gap CV {:.1}% above {:.0}%", cv * 100.0, CV_WARNING * 100.0),
        );
    }

    // Walk the sorted order, dropping slices whose gap from the previously
    // kept slice deviates from the median by more than the tolerance.
    let mut kept = vec![indices[0]];
    let mut removed = 0usize;
    for &i in &indices[1..] {
        let gap = projection(i) - projection(*kept.last().unwrap());
        if gap > 0.0 && (gap - median).abs() / median <= OUTLIER_TOLERANCE {
            kept.push(i);
        } else {
            removed += 1;
            debug!(
                "Dropping outlier slice {} (gap {gap:.3} vs median {median:.3})",
                stack.slices[i].key
            );
        }
    }
    if removed > 0 {
        log.info(
            STAGE,
            format!("removed {removed} outlier slice(s), keeping {}", kept.len()),
        );
        deltas = kept
            .windows(2)
            .map(|w| projection(w[1]) - projection(w[0]))
            .collect();
        deltas.sort_by(|a, b| a.total_cmp(b));
    }
    let median_gap = if deltas.is_empty() {
        None
    } else {
        Some(deltas[deltas.len() / 2])
    };
    Ordering {
        indices: kept,
        median_gap,
    }
}

/// Builds one canonicalized [`Volume`] from an ordered series stack.
///
/// Slices are sorted by patient-position projection onto the stack normal
/// (instance order as fallback), spacing outliers are dropped, pixels are
/// stacked, the volume is reoriented to the canonical near-identity frame,
/// and the anisotropy policy decides between native spacing, isotropic
/// resampling and the 2.5D route.
pub fn assemble(
    stack: &SeriesStack,
    config: &PipelineConfig,
    log: &mut ProgressLog,
) -> Result<AssembledVolume> {
    if stack.len() < 2 {
        return Err(Error::InvalidInput(format!(
            "series {} has {} slice(s); a 3D volume needs at least 2",
            stack.series_uid,
            stack.len()
        )));
    }
    let ordering = order_slices(stack, log);
    if ordering.indices.len() < 2 {
        return Err(Error::DegenerateGeometry(
            "fewer than two slices survive outlier removal".into(),
        ));
    }

    let first = &stack.slices[ordering.indices[0]];
    let nx = first.columns;
    let ny = first.rows;
    let nz = ordering.indices.len();
    let z_gap = ordering
        .median_gap
        .filter(|&g| g > 0.0)
        .unwrap_or_else(|| stack.effective_z_spacing());
    let spacing = [first.pixel_spacing[0], first.pixel_spacing[1], z_gap];

    let mut data = Array3::<f32>::zeros((nz, ny, nx));
    for (z, &slice_index) in ordering.indices.iter().enumerate() {
        let slice = &stack.slices[slice_index];
        if slice.rows != ny || slice.columns != nx {
            return Err(Error::InconsistentSeries {
                series_uid: stack.series_uid.clone(),
                message: format!("matrix size mismatch in {}", slice.key),
            });
        }
        for y in 0..ny {
            for x in 0..nx {
                data[[z, y, x]] = slice.pixels[[y, x]];
            }
        }
    }

    let (direction, origin) = match (first.orientation, first.position) {
        (Some((u, v)), position) => {
            let n = stack.normal().unwrap_or_else(|| u.cross(&v));
            let mut d = Matrix3::identity();
            d.set_column(0, &u.normalize());
            d.set_column(1, &v.normalize());
            d.set_column(2, &n);
            (d, position.unwrap_or_else(Vector3::zeros))
        }
        _ => (Matrix3::identity(), Vector3::zeros()),
    };

    let volume = VolumeBuilder::default()
        .geometry(Geometry {
            dims: [nx, ny, nz],
            spacing,
            origin,
            direction,
        })
        .data(data)
        .build()?;
    log.info(
        STAGE,
        format!("stacked {nz} slice(s) into {nx}x{ny}x{nz} @ {spacing:?} mm"),
    );

    let volume = reorient_to_canonical(&volume);
    if volume.geometry.dims.iter().any(|&d| d < 2) {
        return Err(Error::DegenerateGeometry(format!(
            "assembled volume has a dimension below 2: {:?}",
            volume.geometry.dims
        )));
    }

    let native_z = volume.geometry.spacing[2];
    let r = volume.geometry.anisotropy_ratio();
    log.info(
        STAGE,
        format!(
            "anisotropy: in-plane {:.3}/{:.3} mm, through-plane {native_z:.3} mm, r={r:.2}",
            volume.geometry.spacing[0], volume.geometry.spacing[1]
        ),
    );
    if r > 3.0 {
        log.quality_warning(
            STAGE,
            format!("high anisotropy (r={r:.2} > 3): low quality expected"),
        );
    }

    if native_z >= THICK_STACK_MM && config.force_25d {
        log.info(
            STAGE,
            format!(
                "through-plane {native_z:.2} mm >= {THICK_STACK_MM} mm: 2D-stacked acquisition, \
                 keeping native spacing for the slice-wise branch"
            ),
        );
        return Ok(AssembledVolume {
            volume,
            route: SegmentationRoute::TwoPointFiveD,
            anisotropy_ratio: r,
            native_z,
        });
    }

    if r <= RESAMPLE_RATIO {
        log.info(STAGE, "near-isotropic voxels, keeping native spacing");
        return Ok(AssembledVolume {
            volume,
            route: SegmentationRoute::ThreeD,
            anisotropy_ratio: r,
            native_z,
        });
    }

    let in_plane_min = volume.geometry.spacing[0].min(volume.geometry.spacing[1]);
    let iso = if r <= 3.0 {
        in_plane_min.clamp(1.0, 1.2)
    } else {
        in_plane_min.max(1.2)
    };
    log.info(
        STAGE,
        format!("resampling to isotropic {iso:.2} mm (r={r:.2}, cubic interpolation)"),
    );
    let resampled = resample_to_spacing(&volume, [iso, iso, iso], Interpolation::Cubic);
    if resampled.geometry.dims.iter().any(|&d| d < 2) {
        return Err(Error::DegenerateGeometry(format!(
            "resampled volume has a dimension below 2: {:?}",
            resampled.geometry.dims
        )));
    }
    log.info(
        STAGE,
        format!(
            "isotropic volume {:?} @ {:?} mm",
            resampled.geometry.dims, resampled.geometry.spacing
        ),
    );
    Ok(AssembledVolume {
        volume: resampled,
        route: SegmentationRoute::ThreeD,
        anisotropy_ratio: r,
        native_z,
    })
}
