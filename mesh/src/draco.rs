use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Settings for the external Draco compressor invocation.
///
/// The compressor is an out-of-process tool (`gltf-transform` style CLI)
/// taking an uncompressed GLB and writing a Draco-encoded one. Any failure
/// is surfaced as an error for the caller to treat as recoverable.
#[derive(Clone, Debug)]
pub struct DracoSettings {
    /// Path or name of the compressor executable.
    pub program: String,
    /// Quantization bits for positions.
    pub quantize_position: u32,
    /// Quantization bits for normals.
    pub quantize_normal: u32,
    /// Quantization bits for colors.
    pub quantize_color: u32,
    /// Quantization bits for texture coordinates.
    pub quantize_texcoord: u32,
    /// Draco compression level, 0-10.
    pub compression_level: u32,
    /// Hard wall-clock limit for the subprocess.
    pub timeout_secs: u64,
}

impl Default for DracoSettings {
    fn default() -> Self {
        Self {
            program: "gltf-transform".to_string(),
            quantize_position: 14,
            quantize_normal: 10,
            quantize_color: 8,
            quantize_texcoord: 12,
            compression_level: 10,
            timeout_secs: 300,
        }
    }
}

/// Compresses `input` GLB into a Draco-encoded GLB next to it, returning the
/// compressed bytes.
///
/// The subprocess is killed and [`Error::CompressorTimeout`] returned when it
/// exceeds the configured timeout. A missing executable or a non-zero exit
/// maps to [`Error::Compressor`].
pub fn compress_glb(settings: &DracoSettings, input: &Path) -> Result<Vec<u8>> {
    let output: PathBuf = input.with_extension("draco.glb");
    let mut child = Command::new(&settings.program)
        .arg("draco")
        .arg(input)
        .arg(&output)
        .arg("--quantize-position")
        .arg(settings.quantize_position.to_string())
        .arg("--quantize-normal")
        .arg(settings.quantize_normal.to_string())
        .arg("--quantize-color")
        .arg(settings.quantize_color.to_string())
        .arg("--quantize-texcoord")
        .arg(settings.quantize_texcoord.to_string())
        .arg("--method")
        .arg("edgebreaker")
        .arg("--encode-speed")
        .arg((10 - settings.compression_level).to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Compressor(format!("failed to spawn {}: {e}", settings.program)))?;

    let deadline = Instant::now() + Duration::from_secs(settings.timeout_secs);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!(
                        "Compressor exceeded {} s, killing subprocess",
                        settings.timeout_secs
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::CompressorTimeout(settings.timeout_secs));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(Error::Compressor(format!("wait failed: {e}")));
            }
        }
    };
    if !status.success() {
        let stderr = child
            .stderr
            .take()
            .and_then(|mut s| {
                use std::io::Read;
                let mut buf = String::new();
                s.read_to_string(&mut buf).ok().map(|_| buf)
            })
            .unwrap_or_default();
        return Err(Error::Compressor(format!(
            "exit status {status}: {}",
            stderr.trim()
        )));
    }
    let bytes = std::fs::read(&output)?;
    let _ = std::fs::remove_file(&output);
    let input_len = std::fs::metadata(input).map(|m| m.len()).unwrap_or(0);
    info!(
        "Draco compression: {} -> {} bytes ({:.1}% reduction)",
        input_len,
        bytes.len(),
        if input_len > 0 {
            (1.0 - bytes.len() as f64 / input_len as f64) * 100.0
        } else {
            0.0
        }
    );
    debug!("Compressed GLB written and read back from {}", output.display());
    Ok(bytes)
}
