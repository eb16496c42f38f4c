use std::io::Cursor;
use tracing::debug;

use crate::{Error, Result, TriangleMesh};

/// Serializes a mesh to binary STL.
///
/// STL stores independent triangles with a facet normal; the normal is
/// recomputed per face from the winding so the file is self-consistent even
/// after smoothing moved the vertices.
pub fn write_binary_stl(mesh: &TriangleMesh) -> Result<Vec<u8>> {
    if mesh.is_empty() {
        return Err(Error::EmptyMesh);
    }
    let triangles = mesh.triangles.iter().map(|t| {
        let v0 = mesh.vertices[t[0] as usize];
        let v1 = mesh.vertices[t[1] as usize];
        let v2 = mesh.vertices[t[2] as usize];
        let e1 = [v1[0] - v0[0], v1[1] - v0[1], v1[2] - v0[2]];
        let e2 = [v2[0] - v0[0], v2[1] - v0[1], v2[2] - v0[2]];
        let nx = e1[1] * e2[2] - e1[2] * e2[1];
        let ny = e1[2] * e2[0] - e1[0] * e2[2];
        let nz = e1[0] * e2[1] - e1[1] * e2[0];
        let len = (nx * nx + ny * ny + nz * nz).sqrt();
        let normal = if len > 0.0 {
            [nx / len, ny / len, nz / len]
        } else {
            [0.0, 0.0, 1.0]
        };
        stl_io::Triangle {
            normal: stl_io::Normal::new(normal),
            vertices: [
                stl_io::Vertex::new(v0),
                stl_io::Vertex::new(v1),
                stl_io::Vertex::new(v2),
            ],
        }
    });
    let mut buffer = Cursor::new(Vec::new());
    stl_io::write_stl(&mut buffer, triangles).map_err(|e| Error::Stl(e.to_string()))?;
    let bytes = buffer.into_inner();
    debug!(
        "Serialized binary STL: {} triangles, {} bytes",
        mesh.face_count(),
        bytes.len()
    );
    Ok(bytes)
}
