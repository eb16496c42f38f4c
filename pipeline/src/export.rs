use mri_recon_common::fs::ScopedWorkspace;
use mri_recon_mesh::draco::{DracoSettings, compress_glb};
use mri_recon_mesh::{TriangleMesh, glb, stl};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::progress::ProgressLog;
use crate::storage::ObjectStore;

const STAGE: &str = "export";

pub const STL_CONTENT_TYPE: &str = "application/octet-stream";
pub const GLB_CONTENT_TYPE: &str = "model/gltf-binary";

/// Output blob keys of one job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedKeys {
    pub stl_key: String,
    pub glb_key: String,
}

/// Concatenates per-tissue meshes into one indexed mesh.
pub fn merge_meshes(meshes: Vec<TriangleMesh>) -> TriangleMesh {
    let mut out = TriangleMesh::default();
    let mut normals = Vec::new();
    let mut all_have_normals = true;
    for mesh in meshes {
        let base = out.vertices.len() as u32;
        out.vertices.extend_from_slice(&mesh.vertices);
        out.triangles.extend(
            mesh.triangles
                .iter()
                .map(|t| [t[0] + base, t[1] + base, t[2] + base]),
        );
        match mesh.normals {
            Some(n) => normals.extend_from_slice(&n),
            None => all_have_normals = false,
        }
    }
    if all_have_normals && !normals.is_empty() {
        out.normals = Some(normals);
    }
    out
}

/// Serializes and uploads `mesh.stl` and `mesh.glb` under the job's output
/// prefix. Both payloads are fully built before the first upload starts, so
/// serialization or compressor trouble can never leave a partial output.
/// Draco compression runs when a compressor is configured; its failure falls
/// back to the uncompressed GLB.
pub fn export(
    mesh: &TriangleMesh,
    prefix: &str,
    store: &dyn ObjectStore,
    config: &PipelineConfig,
    workspace: &ScopedWorkspace,
    log: &mut ProgressLog,
) -> Result<ExportedKeys> {
    if mesh.is_empty() {
        return Err(Error::DegenerateGeometry("nothing to export".into()));
    }
    let stl_bytes = stl::write_binary_stl(mesh)?;
    log.info(
        STAGE,
        format!("STL payload: {:.2} MiB", stl_bytes.len() as f64 / (1024.0 * 1024.0)),
    );
    let mut glb_bytes = glb::write_glb(mesh)?;
    log.info(
        STAGE,
        format!("GLB payload: {:.2} MiB", glb_bytes.len() as f64 / (1024.0 * 1024.0)),
    );

    if let Some(program) = &config.compressor_program {
        let settings = DracoSettings {
            program: program.clone(),
            timeout_secs: config.compressor_timeout_secs,
            ..Default::default()
        };
        match workspace
            .stage_blob("uncompressed.glb", &glb_bytes)
            .map_err(Error::from)
            .and_then(|path| compress_glb(&settings, &path).map_err(Error::from))
        {
            Ok(compressed) => {
                log.info(
                    STAGE,
                    format!(
                        "Draco-compressed GLB: {:.2} MiB ({:.1}% reduction)",
                        compressed.len() as f64 / (1024.0 * 1024.0),
                        (1.0 - compressed.len() as f64 / glb_bytes.len() as f64) * 100.0
                    ),
                );
                glb_bytes = compressed;
            }
            Err(e) => {
                log.recoverable(STAGE, format!("compressor failed ({e}), uploading uncompressed GLB"));
            }
        }
    }

    let keys = ExportedKeys {
        stl_key: format!("{}/mesh.stl", prefix.trim_end_matches('/')),
        glb_key: format!("{}/mesh.glb", prefix.trim_end_matches('/')),
    };
    store.put(&keys.stl_key, &stl_bytes, STL_CONTENT_TYPE)?;
    store.put(&keys.glb_key, &glb_bytes, GLB_CONTENT_TYPE)?;
    log.info(
        STAGE,
        format!("uploaded {} and {}", keys.stl_key, keys.glb_key),
    );
    Ok(keys)
}
