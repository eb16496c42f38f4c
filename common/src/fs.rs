use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Blob name escapes the workspace: {0}")]
    InvalidBlobName(String),
}

/// A scratch directory scoped to one reconstruction job.
///
/// The directory is created under the system temp root and removed when the
/// value is dropped, on every exit path. Downloaded slices and intermediate
/// exports are staged here so a crashed or cancelled job never leaves files
/// behind.
#[derive(Debug)]
pub struct ScopedWorkspace {
    dir: TempDir,
}

impl ScopedWorkspace {
    pub fn create() -> Result<Self, WorkspaceError> {
        let dir = TempDir::with_prefix("mri-recon-")?;
        debug!("Created job workspace: {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Stages a blob under the workspace using the final path component of
    /// `key` as the filename.
    ///
    /// # Arguments
    ///
    /// * `key` - The object-store key the blob was fetched from
    /// * `data` - The blob payload
    ///
    /// # Returns
    ///
    /// * `Ok(PathBuf)` - The staged file path inside the workspace
    /// * `Err(WorkspaceError)` - If the key has no usable filename or the write fails
    pub fn stage_blob(&self, key: &str, data: &[u8]) -> Result<PathBuf, WorkspaceError> {
        let name = Path::new(key)
            .file_name()
            .ok_or_else(|| WorkspaceError::InvalidBlobName(key.to_string()))?;
        let path = self.dir.path().join(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Creates (if needed) and returns a subdirectory of the workspace.
    pub fn subdir(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let path = self.dir.path().join(name);
        if !path.exists() {
            std::fs::create_dir_all(&path)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_removed_on_drop() {
        let path;
        {
            let ws = ScopedWorkspace::create().unwrap();
            path = ws.path().to_path_buf();
            assert!(path.is_dir());
        }
        assert!(!path.exists());
    }

    #[test]
    fn stage_blob_uses_final_path_component() {
        let ws = ScopedWorkspace::create().unwrap();
        let staged = ws
            .stage_blob("uploads/job-1/slice_0001.dcm", b"\x00\x01")
            .unwrap();
        assert_eq!(staged.file_name().unwrap().to_str().unwrap(), "slice_0001.dcm");
        assert_eq!(std::fs::read(&staged).unwrap(), vec![0u8, 1u8]);
    }

    #[test]
    fn stage_blob_rejects_key_without_filename() {
        let ws = ScopedWorkspace::create().unwrap();
        assert!(ws.stage_blob("/", b"x").is_err());
    }

    #[test]
    fn subdir_is_created_inside_workspace() {
        let ws = ScopedWorkspace::create().unwrap();
        let sub = ws.subdir("output").unwrap();
        assert!(sub.is_dir());
        assert!(sub.starts_with(ws.path()));
    }
}
