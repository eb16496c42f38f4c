mod common;

use std::sync::atomic::AtomicBool;

use common::{SeriesSpec, write_series};
use mri_recon_pipeline::progress::LogLevel;
use mri_recon_pipeline::storage::{FsObjectStore, MemoryStatusSink, ObjectStore};
use mri_recon_pipeline::{JobRequest, JobStatus, PipelineConfig, Tissue, run_job};

fn job_for(keys: Vec<String>, id: &str) -> JobRequest {
    JobRequest {
        id: id.to_string(),
        input_keys: keys,
        output_prefix: format!("mesh/{id}"),
        // The body surface is the deterministic phantom target; the bone
        // branches are covered by the segmenter's own tests.
        tissues: vec![Tissue::Body],
    }
}

fn log_contains(out: &mri_recon_pipeline::JobOutput, needle: &str) -> bool {
    out.log.entries().iter().any(|e| e.message.contains(needle))
}

fn completed_keys(status: &JobStatus) -> (String, String) {
    match status {
        JobStatus::Completed { stl_key, glb_key } => (stl_key.clone(), glb_key.clone()),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn single_isotropic_series_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_series(dir.path(), &SeriesSpec::volumetric("1.2.840.1.1", 40));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let out = run_job(
        &job_for(keys, "iso"),
        &store,
        &sink,
        PipelineConfig::default(),
        &cancel,
    );
    let (stl_key, glb_key) = completed_keys(&out.status);

    // Near-isotropic input keeps its native spacing.
    assert!(log_contains(&out, "keeping native spacing"));

    let stl = store.get(&stl_key).unwrap().expect("STL uploaded");
    let triangles = u32::from_le_bytes(stl[80..84].try_into().unwrap());
    assert!(triangles > 0);
    let glb = store.get(&glb_key).unwrap().expect("GLB uploaded");
    assert_eq!(&glb[0..4], b"glTF");

    // Status history: processing then terminal completion.
    let history = sink.history("iso");
    assert_eq!(history[0], JobStatus::Processing);
    assert!(matches!(history[1], JobStatus::Completed { .. }));
}

#[test]
fn thick_stack_takes_25d_branch_with_quality_warning() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_series(dir.path(), &SeriesSpec::thick_stack("1.2.840.2.1", 12));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let out = run_job(
        &job_for(keys, "thick"),
        &store,
        &sink,
        PipelineConfig::default(),
        &cancel,
    );
    let (_, glb_key) = completed_keys(&out.status);

    // r = 10: anisotropy warning and no isotropic intensity resample.
    assert!(out.log.has_quality_warnings());
    assert!(log_contains(&out, "2D-stacked acquisition"));
    assert!(store.get(&glb_key).unwrap().is_some());
}

#[test]
fn localizer_is_dropped_and_volumetric_series_wins() {
    let dir = tempfile::tempdir().unwrap();
    let mut keys = write_series(dir.path(), &SeriesSpec::localizer("1.2.840.3.9"));
    keys.extend(write_series(
        dir.path(),
        &SeriesSpec::volumetric("1.2.840.3.1", 40),
    ));
    keys.extend(write_series(
        dir.path(),
        &SeriesSpec::thick_stack("1.2.840.3.2", 8),
    ));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let config = PipelineConfig {
        // Keep the run single-series so the thick alternate is not fused.
        use_multi_plane: false,
        ..Default::default()
    };
    let out = run_job(&job_for(keys, "mixed"), &store, &sink, config, &cancel);
    completed_keys(&out.status);

    assert!(log_contains(&out, "dropping localizer/scout"));
    assert!(log_contains(&out, "primary series 1.2.840.3.1"));
    // Alternates are ranked and recorded in the log.
    assert!(log_contains(&out, "alternate(s)"));
}

#[test]
fn memory_guard_downgrades_large_two_series_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut keys = write_series(dir.path(), &SeriesSpec::volumetric("1.2.840.4.1", 150));
    keys.extend(write_series(
        dir.path(),
        &SeriesSpec::volumetric("1.2.840.4.2", 70),
    ));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let out = run_job(
        &job_for(keys, "large"),
        &store,
        &sink,
        PipelineConfig::default(),
        &cancel,
    );
    completed_keys(&out.status);
    assert!(log_contains(&out, "memory guard"));
    assert!(log_contains(&out, "fusion disabled"));
}

#[test]
fn missing_decimation_backend_is_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_series(dir.path(), &SeriesSpec::volumetric("1.2.840.5.1", 30));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let config = PipelineConfig {
        decimation_enabled: false,
        // Force the decimation path even for a small test mesh.
        decimate_above_faces: 10,
        ..Default::default()
    };
    let out = run_job(&job_for(keys, "nodecim"), &store, &sink, config, &cancel);
    completed_keys(&out.status);
    assert!(out.log.has_recoverable());
    assert!(log_contains(&out, "decimation backend unavailable"));
    assert!(matches!(
        sink.last("nodecim").unwrap(),
        JobStatus::Completed { .. }
    ));
}

#[test]
fn failed_compressor_falls_back_to_uncompressed_glb() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_series(dir.path(), &SeriesSpec::volumetric("1.2.840.6.1", 30));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let config = PipelineConfig {
        compressor_program: Some("no-such-draco-compressor".into()),
        ..Default::default()
    };
    let out = run_job(&job_for(keys, "draco"), &store, &sink, config, &cancel);
    let (_, glb_key) = completed_keys(&out.status);
    assert!(out.log.has_recoverable());
    let glb = store.get(&glb_key).unwrap().unwrap();
    assert_eq!(&glb[0..4], b"glTF", "uncompressed GLB must be uploaded");
}

#[test]
fn selection_is_stable_under_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut keys = write_series(dir.path(), &SeriesSpec::volumetric("1.2.840.7.1", 30));
    keys.extend(write_series(
        dir.path(),
        &SeriesSpec::volumetric("1.2.840.7.2", 30),
    ));
    let store = FsObjectStore::new(dir.path());
    let cancel = AtomicBool::new(false);

    let run = |keys: Vec<String>, id: &str| {
        let sink = MemoryStatusSink::new();
        let out = run_job(
            &job_for(keys, id),
            &store,
            &sink,
            PipelineConfig {
                use_multi_plane: false,
                ..Default::default()
            },
            &cancel,
        );
        out.log
            .entries()
            .iter()
            .find(|e| e.message.contains("primary series"))
            .map(|e| e.message.clone())
            .unwrap()
    };
    let forward = run(keys.clone(), "order-a");
    let mut reversed = keys;
    reversed.reverse();
    let backward = run(reversed, "order-b");
    assert_eq!(forward, backward);
}

#[test]
fn single_slice_input_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_series(
        dir.path(),
        &SeriesSpec {
            slice_count: 1,
            ..SeriesSpec::volumetric("1.2.840.8.1", 1)
        },
    );
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let out = run_job(
        &job_for(keys, "single"),
        &store,
        &sink,
        PipelineConfig::default(),
        &cancel,
    );
    match out.status {
        JobStatus::Failed { kind, .. } => assert_eq!(kind, "invalid_input"),
        other => panic!("expected invalid input, got {other:?}"),
    }
}

#[test]
fn quality_entries_are_structured() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_series(dir.path(), &SeriesSpec::thick_stack("1.2.840.9.1", 10));
    let store = FsObjectStore::new(dir.path());
    let sink = MemoryStatusSink::new();
    let cancel = AtomicBool::new(false);

    let out = run_job(
        &job_for(keys, "structured"),
        &store,
        &sink,
        PipelineConfig::default(),
        &cancel,
    );
    completed_keys(&out.status);
    // Warnings live in the log, not in the terminal status.
    assert!(
        out.log
            .entries()
            .iter()
            .any(|e| e.level == LogLevel::QualityWarning)
    );
}
