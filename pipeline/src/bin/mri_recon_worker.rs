use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use mri_recon_pipeline::cli::Cli;
use mri_recon_pipeline::storage::{FsObjectStore, MemoryStatusSink};
use mri_recon_pipeline::{JobRequest, JobStatus, PipelineConfig, run_job};

/// Log filter environment variable, `RUST_LOG` style.
const ENV_LOG: &str = "MRI_RECON_LOG";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(ENV_LOG)
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level().to_string())),
        )
        .init();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let input_dir = cli
        .input_dir
        .canonicalize()
        .with_context(|| format!("input directory {}", cli.input_dir.display()))?;

    // Every regular file below the input directory is one slice blob; the
    // output prefix is excluded so re-runs do not ingest their own meshes.
    let mut keys = Vec::new();
    for entry in WalkDir::new(&input_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.path().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&input_dir) else {
            continue;
        };
        let key = relative.to_string_lossy().replace('\\', "/");
        if key.starts_with(cli.prefix.trim_end_matches('/')) {
            continue;
        }
        keys.push(key);
    }
    keys.sort();
    anyhow::ensure!(!keys.is_empty(), "no input files under {}", input_dir.display());
    info!("Found {} candidate slice file(s)", keys.len());

    let job = JobRequest {
        id: cli.job_id.clone(),
        input_keys: keys,
        output_prefix: cli.prefix.clone(),
        tissues: cli.tissues.clone(),
    };
    let store = FsObjectStore::new(&input_dir);
    let sink = MemoryStatusSink::new();

    // Cooperative cancellation: Ctrl-C flips the flag, the orchestrator
    // stops at the next stage boundary.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::Relaxed))
            .context("installing the Ctrl-C handler")?;
    }

    let output = run_job(&job, &store, &sink, config, &cancel);
    for entry in output.log.entries() {
        println!(
            "{:>8} ms {:>16} {:?} {}",
            entry.at_ms, entry.stage, entry.level, entry.message
        );
    }
    match output.status {
        JobStatus::Completed { stl_key, glb_key } => {
            println!("completed: {stl_key} {glb_key}");
            Ok(())
        }
        JobStatus::Failed { kind, message } => {
            anyhow::bail!("job failed [{kind}]: {message}")
        }
        other => anyhow::bail!("job ended in non-terminal state {other:?}"),
    }
}
