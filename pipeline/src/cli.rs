use clap::Parser;
use std::path::PathBuf;

use crate::job::Tissue;

/// Reconstructs a surface mesh (binary STL + GLB) from a directory of
/// single-slice DICOM files.
///
/// The input directory acts as the object store: every file below it is
/// treated as one slice blob, and the outputs are written back under the
/// same root at `<prefix>/mesh.stl` and `<prefix>/mesh.glb`.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory containing the input DICOM slices.
    #[arg(short, long)]
    pub input_dir: PathBuf,

    /// Output key prefix, relative to the input directory.
    #[arg(short, long, default_value = "mesh/recon")]
    pub prefix: String,

    /// Job identifier used in status records and logs.
    #[arg(long, default_value = "local")]
    pub job_id: String,

    /// Tissues to segment (repeatable): body, bone, muscle.
    #[arg(short, long, value_delimiter = ',')]
    pub tissues: Vec<Tissue>,

    /// Optional TOML pipeline configuration.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable logging at INFO level.
    #[arg(long, default_value_t = false)]
    pub verbose: bool,
    /// Enable logging at DEBUG level.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Enable logging at TRACE level.
    #[arg(long, default_value_t = false)]
    pub trace: bool,
}

impl Cli {
    /// Log level from the verbosity flags, most detailed flag winning.
    pub fn log_level(&self) -> tracing::Level {
        if self.trace {
            tracing::Level::TRACE
        } else if self.debug {
            tracing::Level::DEBUG
        } else if self.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

impl clap::builder::ValueParserFactory for Tissue {
    type Parser = clap::builder::ValueParser;

    fn value_parser() -> Self::Parser {
        clap::builder::ValueParser::new(|s: &str| s.parse::<Tissue>())
    }
}
