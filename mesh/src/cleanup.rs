use std::collections::HashMap;
use tracing::{debug, info};

use crate::TriangleMesh;

fn triangle_area(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> f64 {
    let e1 = [
        f64::from(b[0] - a[0]),
        f64::from(b[1] - a[1]),
        f64::from(b[2] - a[2]),
    ];
    let e2 = [
        f64::from(c[0] - a[0]),
        f64::from(c[1] - a[1]),
        f64::from(c[2] - a[2]),
    ];
    let n = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];
    0.5 * (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt()
}

/// Drops triangles with repeated indices or (near-)zero area, then drops
/// vertices no triangle references, remapping indices.
pub fn remove_degenerate(mesh: &TriangleMesh) -> TriangleMesh {
    let mut triangles: Vec<[u32; 3]> = Vec::with_capacity(mesh.triangles.len());
    for t in &mesh.triangles {
        if t[0] == t[1] || t[1] == t[2] || t[0] == t[2] {
            continue;
        }
        let area = triangle_area(
            mesh.vertices[t[0] as usize],
            mesh.vertices[t[1] as usize],
            mesh.vertices[t[2] as usize],
        );
        if area <= 1e-18 {
            continue;
        }
        triangles.push(*t);
    }

    let mut remap = vec![u32::MAX; mesh.vertices.len()];
    let mut vertices = Vec::new();
    for t in &mut triangles {
        for i in t.iter_mut() {
            let old = *i as usize;
            if remap[old] == u32::MAX {
                remap[old] = vertices.len() as u32;
                vertices.push(mesh.vertices[old]);
            }
            *i = remap[old];
        }
    }
    if triangles.len() != mesh.triangles.len() || vertices.len() != mesh.vertices.len() {
        debug!(
            "Mesh cleanup: {} -> {} triangles, {} -> {} vertices",
            mesh.triangles.len(),
            triangles.len(),
            mesh.vertices.len(),
            vertices.len()
        );
    }
    TriangleMesh {
        vertices,
        triangles,
        normals: None,
    }
}

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n as u32).collect(),
        }
    }

    fn find(&mut self, i: u32) -> u32 {
        let mut root = i;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        let mut cur = i;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra as usize] = rb;
        }
    }
}

/// Splits a mesh into vertex-connected components.
pub fn split_components(mesh: &TriangleMesh) -> Vec<TriangleMesh> {
    let mut uf = UnionFind::new(mesh.vertices.len());
    for t in &mesh.triangles {
        uf.union(t[0], t[1]);
        uf.union(t[1], t[2]);
    }
    let mut by_root: HashMap<u32, Vec<[u32; 3]>> = HashMap::new();
    for t in &mesh.triangles {
        by_root.entry(uf.find(t[0])).or_default().push(*t);
    }
    let mut roots: Vec<u32> = by_root.keys().copied().collect();
    roots.sort_unstable();
    roots
        .into_iter()
        .map(|root| {
            remove_degenerate(&TriangleMesh {
                vertices: mesh.vertices.clone(),
                triangles: by_root.remove(&root).unwrap(),
                normals: None,
            })
        })
        .collect()
}

/// True when every edge is incident to exactly two triangles.
pub fn is_closed(mesh: &TriangleMesh) -> bool {
    let mut edge_uses: HashMap<(u32, u32), usize> = HashMap::new();
    for t in &mesh.triangles {
        for k in 0..3 {
            let a = t[k];
            let b = t[(k + 1) % 3];
            *edge_uses.entry((a.min(b), a.max(b))).or_insert(0) += 1;
        }
    }
    edge_uses.values().all(|&n| n == 2)
}

/// Keeps the component with the largest enclosed volume, falling back to the
/// largest face count when no component is closed. The winner is re-wound so
/// its signed volume is positive (outward normals).
pub fn keep_largest_component(mesh: &TriangleMesh) -> TriangleMesh {
    let components = split_components(mesh);
    if components.len() <= 1 {
        let mut out = components.into_iter().next().unwrap_or_default();
        orient_outward(&mut out);
        return out;
    }
    let closed: Vec<(usize, f64)> = components
        .iter()
        .enumerate()
        .filter(|(_, c)| is_closed(c))
        .map(|(i, c)| (i, c.signed_volume().abs()))
        .collect();
    let pick = if let Some(&(best, volume)) = closed
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
    {
        info!(
            "Kept largest closed component: volume {:.1}, {} of {} components",
            volume,
            best + 1,
            components.len()
        );
        best
    } else {
        let best = components
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.face_count())
            .map(|(i, _)| i)
            .unwrap();
        info!(
            "No closed component; kept largest by face count ({} faces)",
            components[best].face_count()
        );
        best
    };
    let mut out = components.into_iter().nth(pick).unwrap();
    orient_outward(&mut out);
    out
}

/// Flips the winding when the signed volume of a closed surface is negative.
fn orient_outward(mesh: &mut TriangleMesh) {
    if !mesh.is_empty() && is_closed(mesh) && mesh.signed_volume() < 0.0 {
        mesh.flip_winding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tetrahedron_at(offset: f32, scale: f32) -> TriangleMesh {
        TriangleMesh {
            vertices: vec![
                [offset, 0.0, 0.0],
                [offset + scale, 0.0, 0.0],
                [offset, scale, 0.0],
                [offset, 0.0, scale],
            ],
            triangles: vec![[0, 2, 1], [0, 1, 3], [0, 3, 2], [1, 2, 3]],
            normals: None,
        }
    }

    fn merge(a: &TriangleMesh, b: &TriangleMesh) -> TriangleMesh {
        let mut vertices = a.vertices.clone();
        let base = vertices.len() as u32;
        vertices.extend_from_slice(&b.vertices);
        let mut triangles = a.triangles.clone();
        triangles.extend(b.triangles.iter().map(|t| [t[0] + base, t[1] + base, t[2] + base]));
        TriangleMesh {
            vertices,
            triangles,
            normals: None,
        }
    }

    #[test]
    fn degenerate_triangles_are_removed() {
        let mut m = tetrahedron_at(0.0, 1.0);
        m.triangles.push([0, 0, 1]);
        m.vertices.push([9.0, 9.0, 9.0]); // unreferenced
        let c = remove_degenerate(&m);
        assert_eq!(c.face_count(), 4);
        assert_eq!(c.vertex_count(), 4);
    }

    #[test]
    fn zero_area_triangle_is_removed() {
        let m = TriangleMesh {
            vertices: vec![[0.0; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]],
            triangles: vec![[0, 1, 2]],
            normals: None,
        };
        assert_eq!(remove_degenerate(&m).face_count(), 0);
    }

    #[test]
    fn split_finds_two_components() {
        let m = merge(&tetrahedron_at(0.0, 2.0), &tetrahedron_at(10.0, 1.0));
        let parts = split_components(&m);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.face_count() == 4));
    }

    #[test]
    fn tetrahedron_is_closed() {
        assert!(is_closed(&tetrahedron_at(0.0, 1.0)));
        let mut open = tetrahedron_at(0.0, 1.0);
        open.triangles.pop();
        assert!(!is_closed(&open));
    }

    #[test]
    fn largest_component_wins_by_volume() {
        let m = merge(&tetrahedron_at(0.0, 2.0), &tetrahedron_at(10.0, 1.0));
        let kept = keep_largest_component(&m);
        assert_eq!(kept.face_count(), 4);
        // The big tetrahedron has volume 8/6.
        assert!((kept.signed_volume() - 8.0 / 6.0).abs() < 1e-5);
    }

    #[test]
    fn kept_component_is_wound_outward() {
        let mut flipped = tetrahedron_at(0.0, 1.0);
        flipped.flip_winding();
        let kept = keep_largest_component(&flipped);
        assert!(kept.signed_volume() > 0.0);
    }
}
