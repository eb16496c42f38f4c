use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::job::JobStatus;

/// Blob store the core reads slices from and writes meshes to. The S3
/// adapter lives outside the core; jobs only see this trait.
pub trait ObjectStore {
    /// Fetches a blob, `Ok(None)` when the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Stores a blob under `key` with the given content type.
    fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()>;
}

/// Metadata-store collaborator recording job state transitions.
pub trait StatusSink {
    fn record(&self, job_id: &str, status: JobStatus);
}

/// Filesystem-backed object store used by the worker binary and tests; keys
/// are paths relative to the root directory.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        debug!("Object store get: {key}");
        Ok(Some(std::fs::read(path)?))
    }

    fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)
            .map_err(|e| Error::Storage(format!("put {key} failed: {e}")))?;
        info!(
            "Object store put: {key} ({} bytes, {content_type})",
            data.len()
        );
        Ok(())
    }
}

/// In-memory status sink; the worker binary logs transitions, tests assert
/// on them.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    records: Mutex<HashMap<String, Vec<JobStatus>>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, job_id: &str) -> Vec<JobStatus> {
        self.records
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last(&self, job_id: &str) -> Option<JobStatus> {
        self.history(job_id).last().cloned()
    }
}

impl StatusSink for MemoryStatusSink {
    fn record(&self, job_id: &str, status: JobStatus) {
        info!("Job {job_id} -> {status:?}");
        self.records
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .push(status);
    }
}
