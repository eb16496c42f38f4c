use serde_json::json;
use tracing::debug;

use crate::{Error, Result, TriangleMesh};

const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF"
const CHUNK_JSON: u32 = 0x4E4F_534A; // "JSON"
const CHUNK_BIN: u32 = 0x004E_4942; // "BIN\0"

const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;
const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;
const MODE_TRIANGLES: u32 = 4;

fn pad_to_4(buf: &mut Vec<u8>, fill: u8) {
    while buf.len() % 4 != 0 {
        buf.push(fill);
    }
}

/// Serializes a mesh to a binary glTF (GLB) container with one indexed
/// triangle primitive carrying positions and normals.
pub fn write_glb(mesh: &TriangleMesh) -> Result<Vec<u8>> {
    if mesh.is_empty() {
        return Err(Error::EmptyMesh);
    }
    let mut mesh = mesh.clone();
    if mesh.normals.is_none() {
        mesh.compute_vertex_normals();
    }
    let normals = mesh.normals.as_ref().unwrap();

    let mut bin: Vec<u8> = Vec::new();
    let positions_offset = bin.len();
    for v in &mesh.vertices {
        for a in 0..3 {
            bin.extend_from_slice(&v[a].to_le_bytes());
        }
    }
    let normals_offset = bin.len();
    for n in normals {
        for a in 0..3 {
            bin.extend_from_slice(&n[a].to_le_bytes());
        }
    }
    let indices_offset = bin.len();
    for t in &mesh.triangles {
        for &i in t {
            bin.extend_from_slice(&i.to_le_bytes());
        }
    }
    pad_to_4(&mut bin, 0);

    let (lo, hi) = mesh.bounding_box().expect("non-empty mesh has a bbox");
    let vertex_count = mesh.vertex_count();
    let index_count = mesh.face_count() * 3;
    let gltf = json!({
        "asset": { "version": "2.0", "generator": "mri-recon-mesh" },
        "scene": 0,
        "scenes": [ { "nodes": [0] } ],
        "nodes": [ { "mesh": 0 } ],
        "meshes": [ {
            "primitives": [ {
                "attributes": { "POSITION": 0, "NORMAL": 1 },
                "indices": 2,
                "mode": MODE_TRIANGLES
            } ]
        } ],
        "buffers": [ { "byteLength": bin.len() } ],
        "bufferViews": [
            {
                "buffer": 0,
                "byteOffset": positions_offset,
                "byteLength": vertex_count * 12,
                "target": ARRAY_BUFFER
            },
            {
                "buffer": 0,
                "byteOffset": normals_offset,
                "byteLength": vertex_count * 12,
                "target": ARRAY_BUFFER
            },
            {
                "buffer": 0,
                "byteOffset": indices_offset,
                "byteLength": index_count * 4,
                "target": ELEMENT_ARRAY_BUFFER
            }
        ],
        "accessors": [
            {
                "bufferView": 0,
                "componentType": FLOAT,
                "count": vertex_count,
                "type": "VEC3",
                "min": lo,
                "max": hi
            },
            {
                "bufferView": 1,
                "componentType": FLOAT,
                "count": vertex_count,
                "type": "VEC3"
            },
            {
                "bufferView": 2,
                "componentType": UNSIGNED_INT,
                "count": index_count,
                "type": "SCALAR"
            }
        ]
    });
    let mut json_bytes = serde_json::to_vec(&gltf)?;
    pad_to_4(&mut json_bytes, b' ');

    let total = 12 + 8 + json_bytes.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);

    debug!(
        "Serialized GLB: {} vertices, {} faces, {} bytes",
        vertex_count,
        mesh.face_count(),
        out.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetrahedron() -> TriangleMesh {
        TriangleMesh {
            vertices: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            triangles: vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
            normals: None,
        }
    }

    #[test]
    fn glb_header_and_chunks() {
        let bytes = write_glb(&tetrahedron()).unwrap();
        assert_eq!(&bytes[0..4], b"glTF");
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        let total = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(total as usize, bytes.len());
        assert_eq!(bytes.len() % 4, 0);
        // First chunk is JSON.
        assert_eq!(&bytes[16..20], b"JSON");
    }

    #[test]
    fn json_chunk_parses_and_references_buffer() {
        let bytes = write_glb(&tetrahedron()).unwrap();
        let json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let doc: serde_json::Value = serde_json::from_slice(&bytes[20..20 + json_len]).unwrap();
        assert_eq!(doc["asset"]["version"], "2.0");
        assert_eq!(doc["accessors"][0]["count"], 4);
        assert_eq!(doc["accessors"][2]["count"], 12);
        let bin_len = doc["buffers"][0]["byteLength"].as_u64().unwrap() as usize;
        // BIN chunk header follows the padded JSON chunk.
        let bin_header = 20 + json_len;
        let declared = u32::from_le_bytes(bytes[bin_header..bin_header + 4].try_into().unwrap());
        assert_eq!(declared as usize, bin_len);
        assert_eq!(&bytes[bin_header + 4..bin_header + 8], b"BIN\0");
    }

    #[test]
    fn position_accessor_bounds_match_mesh() {
        let bytes = write_glb(&tetrahedron()).unwrap();
        let json_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let doc: serde_json::Value = serde_json::from_slice(&bytes[20..20 + json_len]).unwrap();
        let max: Vec<f64> = doc["accessors"][0]["max"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(max, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn empty_mesh_is_rejected() {
        assert!(matches!(
            write_glb(&TriangleMesh::default()),
            Err(Error::EmptyMesh)
        ));
    }
}
