use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info};

use mri_recon_common::fs::ScopedWorkspace;
use mri_recon_mesh::TriangleMesh;
use mri_recon_volume::Volume;
use mri_recon_volume::resample::{Interpolation, crop_mask_to_content, resample_to_spacing};

use crate::assemble::{SegmentationRoute, assemble};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::export::{ExportedKeys, export, merge_meshes};
use crate::inspect::{inspect, validate_geometry};
use crate::job::{JobRequest, JobStatus};
use crate::preprocess::preprocess;
use crate::progress::ProgressLog;
use crate::register::{fuse_max, rigid_register};
use crate::segment::segment;
use crate::select::select;
use crate::storage::{ObjectStore, StatusSink};
use crate::surface::extract_surface;

const STAGE: &str = "orchestrate";

/// Sanity range for the bounding box of a human-scale mesh, metres.
const BBOX_EDGE_MIN_M: f32 = 0.02;
const BBOX_EDGE_MAX_M: f32 = 2.0;

/// Margin kept around the mask content when cropping background away, mm.
const CROP_MARGIN_MM: f64 = 15.0;

/// Terminal outcome of one job plus its full progress log.
#[derive(Debug)]
pub struct JobOutput {
    pub status: JobStatus,
    pub log: ProgressLog,
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn bbox_sanity(mesh: &TriangleMesh, log: &mut ProgressLog) {
    if let Some((lo, hi)) = mesh.bounding_box() {
        for a in 0..3 {
            let edge = hi[a] - lo[a];
            if !(BBOX_EDGE_MIN_M..=BBOX_EDGE_MAX_M).contains(&edge) {
                log.quality_warning(
                    STAGE,
                    format!(
                        "mesh bounding-box edge {a} is {edge:.3} m, outside \
                         [{BBOX_EDGE_MIN_M}, {BBOX_EDGE_MAX_M}]"
                    ),
                );
            }
        }
    }
}

/// Runs the whole reconstruction for one job and returns the exported keys.
///
/// Stages are strictly sequential; the cancellation flag is honoured at
/// stage boundaries. Intermediate volumes are dropped as soon as the next
/// stage no longer needs them to bound peak memory.
fn run_pipeline(
    job: &JobRequest,
    store: &dyn ObjectStore,
    config: &PipelineConfig,
    cancel: &AtomicBool,
    log: &mut ProgressLog,
) -> Result<ExportedKeys> {
    let workspace = ScopedWorkspace::create()?;

    // C1: read and group slices.
    let t = Instant::now();
    check_cancel(cancel)?;
    let stacks = inspect(store, &job.input_keys, log)?;
    log.stage_done("inspect", t, format!("{} stack(s)", stacks.len()));

    // C2: choose the primary series.
    let t = Instant::now();
    check_cancel(cancel)?;
    let selection = select(stacks, config, log)?;
    validate_geometry(&selection.primary)?;
    log.stage_done(
        "select",
        t,
        format!("primary {}", selection.primary.series_uid),
    );

    // C3: assemble, reorient, resample the primary.
    let t = Instant::now();
    check_cancel(cancel)?;
    let assembled = assemble(&selection.primary, config, log)?;
    let route = assembled.route;
    log.stage_done(
        "assemble",
        t,
        format!("{:?} @ {:?} mm", assembled.volume.geometry.dims, assembled.volume.geometry.spacing),
    );

    // C4: intensity preprocessing.
    let t = Instant::now();
    check_cancel(cancel)?;
    let mut volume = preprocess(&assembled.volume, config, log)?;
    drop(assembled);
    log.stage_done("preprocess", t, "bias/window/smooth");

    // C6 (optional): register alternates to the primary and fuse.
    if selection.fuse && !selection.alternates.is_empty() {
        if route == SegmentationRoute::TwoPointFiveD {
            log.info(
                STAGE,
                "thick-slice primary routes to the 2.5D branch, skipping fusion",
            );
        } else {
            let t = Instant::now();
            check_cancel(cancel)?;
            let iso = [config.target_spacing; 3];
            let mut fused: Vec<Volume> =
                vec![resample_to_spacing(&volume, iso, Interpolation::Cubic)];
            for stack in &selection.alternates {
                if let Err(e) = validate_geometry(stack) {
                    log.recoverable(STAGE, format!("skipping alternate: {e}"));
                    continue;
                }
                let prepared = assemble(stack, config, log)
                    .and_then(|a| preprocess(&a.volume, config, log))
                    .map(|v| resample_to_spacing(&v, iso, Interpolation::Cubic));
                match prepared {
                    Ok(moving) => {
                        let registered = rigid_register(&fused[0], &moving, log);
                        fused.push(registered);
                        // The moving volume drops here, before the next pair.
                    }
                    Err(e) => {
                        log.recoverable(STAGE, format!("skipping alternate: {e}"));
                    }
                }
            }
            if fused.len() > 1 {
                volume = fuse_max(fused, log);
            } else {
                volume = fused.into_iter().next().unwrap();
                log.info(STAGE, "no alternate survived preparation, keeping primary only");
            }
            log.stage_done("register", t, "multi-plane fusion");
        }
    }
    drop(selection);

    // C5: tissue masks.
    let t = Instant::now();
    check_cancel(cancel)?;
    let tissues = if job.tissues.is_empty() {
        config.default_tissues.clone()
    } else {
        job.tissues.clone()
    };
    let masks = segment(&volume, route, &tissues, config, log)?;
    drop(volume);
    log.stage_done("segment", t, format!("{} mask(s)", masks.len()));

    // C7: one surface per mask, merged for export.
    let t = Instant::now();
    check_cancel(cancel)?;
    let mut meshes = Vec::new();
    for (tissue, mask) in masks {
        // Background-slab removal: crop to the mask content plus margin so
        // the distance field and marching cubes only see occupied space.
        let mask = crop_mask_to_content(&mask, CROP_MARGIN_MM);
        let mesh = extract_surface(&mask, config, log)?;
        log.info(
            STAGE,
            format!("{tissue} surface: {} faces", mesh.face_count()),
        );
        bbox_sanity(&mesh, log);
        meshes.push(mesh);
        // The mask drops here, as soon as its surface exists.
    }
    let mesh = merge_meshes(meshes);
    log.stage_done("surface", t, format!("{} total faces", mesh.face_count()));

    // C8: serialize and upload.
    let t = Instant::now();
    check_cancel(cancel)?;
    let keys = export(&mesh, &job.output_prefix, store, config, &workspace, log)?;
    log.stage_done("export", t, format!("{} + {}", keys.stl_key, keys.glb_key));
    Ok(keys)
}

/// Entry point the worker calls per job: records `Processing`, runs the
/// pipeline, and records the terminal status carrying the first fatal
/// error's kind and message on failure.
///
/// Environment knobs are folded into the config here, once, before any stage
/// runs.
pub fn run_job(
    job: &JobRequest,
    store: &dyn ObjectStore,
    sink: &dyn StatusSink,
    config: PipelineConfig,
    cancel: &AtomicBool,
) -> JobOutput {
    let config = config.with_env_overrides();
    let mut log = ProgressLog::new();
    sink.record(&job.id, JobStatus::Processing);
    info!(
        "Job {}: {} input blob(s) -> {}",
        job.id,
        job.input_keys.len(),
        job.output_prefix
    );
    let status = match run_pipeline(job, store, &config, cancel, &mut log) {
        Ok(keys) => JobStatus::Completed {
            stl_key: keys.stl_key,
            glb_key: keys.glb_key,
        },
        Err(e) => {
            error!("Job {} failed: {e}", job.id);
            JobStatus::Failed {
                kind: e.kind().to_string(),
                message: e.to_string(),
            }
        }
    };
    sink.record(&job.id, status.clone());
    JobOutput { status, log }
}
