use mri_recon_common::fs::WorkspaceError;

/// Fatal pipeline errors. Everything else (bias-correction failure, missing
/// decimation, compressor trouble, out-of-band coverage) is logged and
/// recovered from; only contract violations and empty-output conditions fail
/// a job.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Inconsistent series {series_uid}: {message}")]
    InconsistentSeries { series_uid: String, message: String },
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),
    #[error("Object store error: {0}")]
    Storage(String),
    #[error("Job cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("Mesh error: {0}")]
    Mesh(#[from] mri_recon_mesh::Error),
    #[error("Volume construction error: {0}")]
    VolumeBuild(#[from] mri_recon_volume::VolumeBuildError),
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Stable kind string recorded in the job's terminal status.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::InconsistentSeries { .. } => "inconsistent_series",
            Error::DegenerateGeometry(_) => "degenerate_geometry",
            Error::Storage(_) => "storage",
            Error::Cancelled => "cancelled",
            Error::IO(_) => "io",
            Error::Workspace(_) => "workspace",
            Error::Mesh(_) => "mesh",
            Error::VolumeBuild(_) => "volume_build",
            Error::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
