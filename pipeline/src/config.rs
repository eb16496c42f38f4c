use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};
use crate::job::Tissue;

/// All tunables of the reconstruction pipeline, threaded explicitly through
/// the orchestrator. Environment overrides are folded in exactly once at job
/// start by [`PipelineConfig::with_env_overrides`]; no stage reads the
/// environment on its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Isotropic resample target in millimetres for the fusion path and for
    /// upsampling 2.5D masks before meshing.
    pub target_spacing: f64,
    /// Tissues segmented when the job does not specify any.
    pub default_tissues: Vec<Tissue>,
    /// Whether multi-series inputs are rigidly registered and fused.
    pub use_multi_plane: bool,
    /// Inputs above either bound downgrade to single-series processing.
    pub memory_guard_max_slices: usize,
    pub memory_guard_max_series: usize,
    /// Requested marching-cubes step size. Values other than 1 are overridden
    /// to 1 with a warning; coarser stepping punches holes in thin cortex.
    pub mc_step_size: u32,
    /// Enables the slice-by-slice bone branch for thick-slice acquisitions.
    pub force_25d: bool,
    /// Enables multi-level bias-field correction before windowing.
    pub bias_correction: bool,
    /// Unconditional series selection override.
    pub force_series_uid: Option<String>,
    /// Taubin smoothing iterations (clamped to 2).
    pub taubin_iterations: usize,
    /// Largest hole, in rim triangles, that post-processing will cap.
    pub hole_fill_triangles: usize,
    /// Face count above which quadric decimation runs.
    pub decimate_above_faces: usize,
    /// Fraction of faces kept by decimation.
    pub decimate_keep_ratio: f64,
    /// When false the decimation backend is treated as unavailable.
    pub decimation_enabled: bool,
    /// Smallest muscle component kept, in voxels.
    pub muscle_min_object_voxels: usize,
    /// External Draco compressor executable; `None` disables compression.
    pub compressor_program: Option<String>,
    /// Wall-clock limit for the compressor subprocess, seconds.
    pub compressor_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_spacing: 1.0,
            default_tissues: vec![Tissue::Bone],
            use_multi_plane: true,
            memory_guard_max_slices: 200,
            memory_guard_max_series: 3,
            mc_step_size: 1,
            force_25d: true,
            bias_correction: true,
            force_series_uid: None,
            taubin_iterations: 2,
            hole_fill_triangles: 80,
            decimate_above_faces: 150_000,
            decimate_keep_ratio: 0.75,
            decimation_enabled: true,
            muscle_min_object_voxels: 5000,
            compressor_program: None,
            compressor_timeout_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// Loads a TOML config file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies the recognized environment knobs. Called once when a job
    /// starts; the returned config is what every stage sees.
    ///
    /// * `MC_STEP_SIZE` - requested marching-cubes step size
    /// * `FORCE_25D` - `"0"` disables the 2.5D segmentation branch
    /// * `FORCE_SERIES_UID` - series selection override
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(step) = std::env::var("MC_STEP_SIZE") {
            match step.trim().parse::<u32>() {
                Ok(v) => self.mc_step_size = v,
                Err(_) => warn!("Ignoring unparsable MC_STEP_SIZE: {step:?}"),
            }
        }
        if let Ok(v) = std::env::var("FORCE_25D") {
            self.force_25d = v.trim() != "0";
        }
        if let Ok(uid) = std::env::var("FORCE_SERIES_UID") {
            let uid = uid.trim().to_string();
            if !uid.is_empty() {
                self.force_series_uid = Some(uid);
            }
        }
        self
    }

    /// The step size actually used by marching cubes. Requests other than 1
    /// are overridden for cortical preservation; the caller logs the warning.
    pub fn effective_mc_step(&self) -> (u32, bool) {
        if self.mc_step_size == 1 {
            (1, false)
        } else {
            (1, true)
        }
    }

    pub fn taubin_iterations_clamped(&self) -> usize {
        self.taubin_iterations.min(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = PipelineConfig::default();
        assert_eq!(c.target_spacing, 1.0);
        assert_eq!(c.memory_guard_max_slices, 200);
        assert_eq!(c.memory_guard_max_series, 3);
        assert_eq!(c.decimate_above_faces, 150_000);
        assert!(c.force_25d);
    }

    #[test]
    fn step_size_is_always_overridden_to_one() {
        let c = PipelineConfig {
            mc_step_size: 4,
            ..Default::default()
        };
        let (step, warned) = c.effective_mc_step();
        assert_eq!(step, 1);
        assert!(warned);
        let (step, warned) = PipelineConfig::default().effective_mc_step();
        assert_eq!(step, 1);
        assert!(!warned);
    }

    #[test]
    fn taubin_iterations_never_exceed_two() {
        let c = PipelineConfig {
            taubin_iterations: 9,
            ..Default::default()
        };
        assert_eq!(c.taubin_iterations_clamped(), 2);
    }

    #[test]
    fn toml_round_trip() {
        let c = PipelineConfig {
            target_spacing: 1.2,
            compressor_program: Some("gltf-transform".into()),
            ..Default::default()
        };
        let text = toml::to_string(&c).unwrap();
        let back: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.target_spacing, 1.2);
        assert_eq!(back.compressor_program.as_deref(), Some("gltf-transform"));
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let back: PipelineConfig = toml::from_str("target_spacing = 1.1\n").unwrap();
        assert_eq!(back.target_spacing, 1.1);
        assert_eq!(back.memory_guard_max_slices, 200);
    }
}
