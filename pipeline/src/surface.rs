use tracing::debug;

use mri_recon_mesh::marching::marching_cubes;
use mri_recon_mesh::sdf::signed_distance_field;
use mri_recon_mesh::{TriangleMesh, cleanup, decimate, holes, smooth};
use mri_recon_volume::filter::gaussian_smooth_vox;
use mri_recon_volume::geometry::{Mask, Volume};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressLog;

const STAGE: &str = "surface";

/// Sigma, in voxels, of the mask pre-smooth that suppresses staircase
/// blockiness without erasing thin cortex.
const MASK_PRESMOOTH_SIGMA_VOX: f64 = 0.6;

/// Taubin parameters; more than two iterations destroys cortex.
const TAUBIN_LAMBDA: f32 = 0.5;
const TAUBIN_MU: f32 = -0.53;

/// Converts a vertex from millimetres on the voxel grid to the render-space
/// frame: through the direction/origin into LPS, then `x = -L, y = S, z = P`
/// and millimetres to metres.
fn grid_to_render(mask: &Mask, v: [f32; 3]) -> [f32; 3] {
    let g = &mask.geometry;
    let p = [f64::from(v[0]), f64::from(v[1]), f64::from(v[2])];
    let d = &g.direction;
    let lps = [
        d[(0, 0)] * p[0] + d[(0, 1)] * p[1] + d[(0, 2)] * p[2] + g.origin[0],
        d[(1, 0)] * p[0] + d[(1, 1)] * p[1] + d[(1, 2)] * p[2] + g.origin[1],
        d[(2, 0)] * p[0] + d[(2, 1)] * p[1] + d[(2, 2)] * p[2] + g.origin[2],
    ];
    [
        (-lps[0] * 0.001) as f32,
        (lps[2] * 0.001) as f32,
        (lps[1] * 0.001) as f32,
    ]
}

/// Extracts the render-space surface mesh of a binary mask.
///
/// Pipeline: light Gaussian pre-smooth of the mask, signed distance field,
/// marching cubes at level zero (midpoint retry on a level-out-of-range
/// failure), coordinate conversion to the render frame, degenerate cleanup,
/// largest-component selection, Taubin smoothing, hole filling, and quadric
/// decimation above the face budget (recoverable when unavailable).
pub fn extract_surface(
    mask: &Mask,
    config: &PipelineConfig,
    log: &mut ProgressLog,
) -> Result<TriangleMesh> {
    if mask.is_empty() {
        return Err(Error::DegenerateGeometry("empty mask, no surface".into()));
    }
    let (step, overridden) = config.effective_mc_step();
    if overridden {
        log.quality_warning(
            STAGE,
            format!(
                "requested marching-cubes step {} overridden to {step} for cortical preservation",
                config.mc_step_size
            ),
        );
    }

    // The mask is smoothed as a scalar field, then the SDF is taken from its
    // re-thresholded support.
    let as_volume = Volume {
        geometry: mask.geometry.clone(),
        data: mask.data.mapv(f32::from),
    };
    let smoothed = gaussian_smooth_vox(&as_volume, MASK_PRESMOOTH_SIGMA_VOX);
    let support = smoothed.data.mapv(|v| u8::from(v >= 0.5));
    let sdf = signed_distance_field(&support, mask.geometry.spacing);

    let mesh = match marching_cubes(&sdf, mask.geometry.spacing, 0.0) {
        Ok(mesh) => mesh,
        Err(mri_recon_mesh::Error::LevelOutOfRange { min, max, .. }) => {
            let midpoint = (min + max) / 2.0;
            log.recoverable(
                STAGE,
                format!("level 0 outside SDF range [{min:.2}, {max:.2}], retrying at {midpoint:.2}"),
            );
            marching_cubes(&sdf, mask.geometry.spacing, midpoint)
                .map_err(|_| Error::DegenerateGeometry("marching cubes produced no vertices".into()))?
        }
        Err(mri_recon_mesh::Error::EmptySurface) => {
            return Err(Error::DegenerateGeometry(
                "marching cubes produced no vertices".into(),
            ));
        }
        Err(e) => return Err(e.into()),
    };
    log.info(
        STAGE,
        format!(
            "marching cubes: {} vertices, {} faces",
            mesh.vertex_count(),
            mesh.face_count()
        ),
    );

    let mut mesh = mesh;
    mesh.map_vertices(|v| grid_to_render(mask, v));
    let mesh = cleanup::remove_degenerate(&mesh);
    let mut mesh = cleanup::keep_largest_component(&mesh);
    if mesh.is_empty() {
        return Err(Error::DegenerateGeometry(
            "no component survives cleanup".into(),
        ));
    }
    debug!(
        "After cleanup: {} vertices, {} faces",
        mesh.vertex_count(),
        mesh.face_count()
    );

    smooth::taubin(
        &mut mesh,
        TAUBIN_LAMBDA,
        TAUBIN_MU,
        config.taubin_iterations_clamped(),
    );
    let filled = holes::fill_holes(&mut mesh, config.hole_fill_triangles);
    if filled > 0 {
        log.info(STAGE, format!("filled {filled} small hole(s)"));
    }

    if mesh.face_count() > config.decimate_above_faces {
        if !config.decimation_enabled {
            log.recoverable(
                STAGE,
                format!(
                    "decimation backend unavailable, emitting {} faces undecimated",
                    mesh.face_count()
                ),
            );
        } else {
            let target =
                (mesh.face_count() as f64 * config.decimate_keep_ratio).round() as usize;
            match decimate::quadric_decimate(&mesh, target) {
                Ok(simplified) => {
                    log.info(
                        STAGE,
                        format!(
                            "decimated {} -> {} faces",
                            mesh.face_count(),
                            simplified.face_count()
                        ),
                    );
                    mesh = simplified;
                }
                Err(e) => {
                    log.recoverable(STAGE, format!("decimation failed ({e}), keeping full mesh"));
                }
            }
        }
    }

    mesh.compute_vertex_normals();
    log.info(
        STAGE,
        format!(
            "final mesh: {} vertices, {} faces",
            mesh.vertex_count(),
            mesh.face_count()
        ),
    );
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mri_recon_volume::geometry::Geometry;
    use nalgebra::{Matrix3, Vector3};

    fn ball_mask(dims: [usize; 3], spacing: [f64; 3], origin: [f64; 3], radius: f64) -> Mask {
        let geometry = Geometry {
            dims,
            spacing,
            origin: Vector3::from_row_slice(&origin),
            direction: Matrix3::identity(),
        };
        let mut mask = Mask::zeros(geometry);
        let c = [
            (dims[0] - 1) as f64 / 2.0,
            (dims[1] - 1) as f64 / 2.0,
            (dims[2] - 1) as f64 / 2.0,
        ];
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    let d = (((x as f64 - c[0]) * spacing[0]).powi(2)
                        + ((y as f64 - c[1]) * spacing[1]).powi(2)
                        + ((z as f64 - c[2]) * spacing[2]).powi(2))
                    .sqrt();
                    if d <= radius {
                        mask.set(x, y, z, true);
                    }
                }
            }
        }
        mask
    }

    #[test]
    fn ball_becomes_closed_render_space_mesh() {
        let mask = ball_mask([24, 24, 24], [1.0; 3], [0.0; 3], 8.0);
        let config = PipelineConfig::default();
        let mut log = ProgressLog::new();
        let mesh = extract_surface(&mask, &config, &mut log).unwrap();
        assert!(mesh.face_count() > 50);
        assert!(cleanup::is_closed(&mesh));
        // Radius 8 mm -> 16 mm diameter -> 0.016 m bounding box edges.
        let (lo, hi) = mesh.bounding_box().unwrap();
        for a in 0..3 {
            let edge = hi[a] - lo[a];
            assert!(
                (0.012..=0.020).contains(&edge),
                "edge {a} is {edge} m, expected ~0.016"
            );
        }
        assert!(mesh.normals.is_some());
    }

    #[test]
    fn render_frame_flips_l_and_swaps_axes() {
        // A voxel at LPS (10, 20, 30) mm must land at (-0.01, 0.03, 0.02) m.
        let mask = ball_mask([4, 4, 4], [1.0; 3], [0.0; 3], 2.0);
        let p = grid_to_render(&mask, [10.0, 20.0, 30.0]);
        assert!((p[0] + 0.01).abs() < 1e-6);
        assert!((p[1] - 0.03).abs() < 1e-6);
        assert!((p[2] - 0.02).abs() < 1e-6);
    }

    #[test]
    fn origin_shifts_render_coordinates() {
        let a = ball_mask([16, 16, 16], [1.0; 3], [0.0; 3], 5.0);
        let b = ball_mask([16, 16, 16], [1.0; 3], [100.0, 0.0, 0.0], 5.0);
        let config = PipelineConfig::default();
        let mut log = ProgressLog::new();
        let ma = extract_surface(&a, &config, &mut log).unwrap();
        let mb = extract_surface(&b, &config, &mut log).unwrap();
        let ca = ma.bounding_box().unwrap();
        let cb = mb.bounding_box().unwrap();
        // +100 mm along L shows up as -0.1 m along render x.
        assert!(((cb.0[0] - ca.0[0]) + 0.1).abs() < 1e-4);
    }

    #[test]
    fn empty_mask_is_degenerate() {
        let geometry = Geometry {
            dims: [8, 8, 8],
            spacing: [1.0; 3],
            origin: Vector3::zeros(),
            direction: Matrix3::identity(),
        };
        let mask = Mask::zeros(geometry);
        let config = PipelineConfig::default();
        let mut log = ProgressLog::new();
        assert!(matches!(
            extract_surface(&mask, &config, &mut log),
            Err(Error::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn requested_step_size_is_overridden_with_warning() {
        let mask = ball_mask([16, 16, 16], [1.0; 3], [0.0; 3], 5.0);
        let config = PipelineConfig {
            mc_step_size: 4,
            ..Default::default()
        };
        let mut log = ProgressLog::new();
        let _ = extract_surface(&mask, &config, &mut log).unwrap();
        assert!(log.has_quality_warnings());
    }

    #[test]
    fn anisotropic_mask_produces_metric_mesh() {
        // 0.5 x 0.5 x 5.0 mm grid, ball radius 10 mm: the mesh must still be
        // ~20 mm across in every direction.
        let mask = ball_mask([48, 48, 9], [0.5, 0.5, 5.0], [0.0; 3], 10.0);
        let config = PipelineConfig::default();
        let mut log = ProgressLog::new();
        let mesh = extract_surface(&mask, &config, &mut log).unwrap();
        let (lo, hi) = mesh.bounding_box().unwrap();
        for a in 0..3 {
            let edge = hi[a] - lo[a];
            assert!(
                (0.012..=0.026).contains(&edge),
                "edge {a} is {edge} m for a 20 mm ball"
            );
        }
    }
}
