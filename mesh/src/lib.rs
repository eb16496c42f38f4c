#![allow(dead_code)]

pub mod cleanup;
pub mod decimate;
pub mod draco;
pub mod glb;
pub mod holes;
pub mod marching;
pub mod sdf;
pub mod smooth;
pub mod stl;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Iso level {level} outside scalar field range [{min}, {max}]")]
    LevelOutOfRange { level: f32, min: f32, max: f32 },
    #[error("Surface extraction produced no triangles")]
    EmptySurface,
    #[error("Mesh has no triangles to export")]
    EmptyMesh,
    #[error("Decimation failed: {0}")]
    Decimation(String),
    #[error("STL serialization failed: {0}")]
    Stl(String),
    #[error("GLB serialization failed: {0}")]
    Glb(#[from] serde_json::Error),
    #[error("External compressor failed: {0}")]
    Compressor(String),
    #[error("External compressor timed out after {0} s")]
    CompressorTimeout(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An indexed triangle mesh.
///
/// Coordinates are whatever frame the producing stage works in: marching
/// cubes emits millimetres on the voxel grid, the pipeline converts to the
/// render-space frame in metres before export.
#[derive(Clone, Debug, Default)]
pub struct TriangleMesh {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
}

impl TriangleMesh {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn face_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Axis-aligned bounding box as `(min, max)`, or `None` when empty.
    pub fn bounding_box(&self) -> Option<([f32; 3], [f32; 3])> {
        if self.vertices.is_empty() {
            return None;
        }
        let mut lo = [f32::MAX; 3];
        let mut hi = [f32::MIN; 3];
        for v in &self.vertices {
            for a in 0..3 {
                lo[a] = lo[a].min(v[a]);
                hi[a] = hi[a].max(v[a]);
            }
        }
        Some((lo, hi))
    }

    /// Applies a point transform to every vertex and drops stale normals.
    pub fn map_vertices<F: Fn([f32; 3]) -> [f32; 3]>(&mut self, f: F) {
        for v in &mut self.vertices {
            *v = f(*v);
        }
        self.normals = None;
    }

    /// Signed volume by the divergence theorem; positive for outward-wound
    /// closed surfaces.
    pub fn signed_volume(&self) -> f64 {
        let mut acc = 0.0f64;
        for t in &self.triangles {
            let a = self.vertices[t[0] as usize];
            let b = self.vertices[t[1] as usize];
            let c = self.vertices[t[2] as usize];
            let a = [f64::from(a[0]), f64::from(a[1]), f64::from(a[2])];
            let b = [f64::from(b[0]), f64::from(b[1]), f64::from(b[2])];
            let c = [f64::from(c[0]), f64::from(c[1]), f64::from(c[2])];
            acc += (a[0] * (b[1] * c[2] - b[2] * c[1])
                - a[1] * (b[0] * c[2] - b[2] * c[0])
                + a[2] * (b[0] * c[1] - b[1] * c[0]))
                / 6.0;
        }
        acc
    }

    /// Reverses the winding of every triangle.
    pub fn flip_winding(&mut self) {
        for t in &mut self.triangles {
            t.swap(1, 2);
        }
        if let Some(normals) = &mut self.normals {
            for n in normals {
                for a in 0..3 {
                    n[a] = -n[a];
                }
            }
        }
    }

    /// Area-weighted per-vertex normals, normalized.
    pub fn compute_vertex_normals(&mut self) {
        let mut normals = vec![[0.0f32; 3]; self.vertices.len()];
        for t in &self.triangles {
            let a = self.vertices[t[0] as usize];
            let b = self.vertices[t[1] as usize];
            let c = self.vertices[t[2] as usize];
            let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
            let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
            let n = [
                e1[1] * e2[2] - e1[2] * e2[1],
                e1[2] * e2[0] - e1[0] * e2[2],
                e1[0] * e2[1] - e1[1] * e2[0],
            ];
            for &i in t {
                for a in 0..3 {
                    normals[i as usize][a] += n[a];
                }
            }
        }
        for n in &mut normals {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            if len > 0.0 {
                for a in 0..3 {
                    n[a] /= len;
                }
            } else {
                *n = [0.0, 0.0, 1.0];
            }
        }
        self.normals = Some(normals);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit tetrahedron with outward winding.
    pub(crate) fn tetrahedron() -> TriangleMesh {
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
    fn tetrahedron_volume() {
        let t = tetrahedron();
        assert!((t.signed_volume() - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn flipping_negates_volume() {
        let mut t = tetrahedron();
        t.flip_winding();
        assert!((t.signed_volume() + 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn bounding_box_spans_vertices() {
        let t = tetrahedron();
        let (lo, hi) = t.bounding_box().unwrap();
        assert_eq!(lo, [0.0, 0.0, 0.0]);
        assert_eq!(hi, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn vertex_normals_are_unit() {
        let mut t = tetrahedron();
        t.compute_vertex_normals();
        for n in t.normals.as_ref().unwrap() {
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            assert!((len - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn map_vertices_scales_and_drops_normals() {
        let mut t = tetrahedron();
        t.compute_vertex_normals();
        t.map_vertices(|v| [v[0] * 2.0, v[1] * 2.0, v[2] * 2.0]);
        assert!(t.normals.is_none());
        assert!((t.signed_volume() - 8.0 / 6.0).abs() < 1e-6);
    }
}
