use std::collections::HashMap;
use tracing::{debug, warn};

use crate::TriangleMesh;

/// Boundary edges (incident to exactly one triangle) as directed `a -> b`
/// pairs following the triangle winding.
fn boundary_edges(mesh: &TriangleMesh) -> Vec<(u32, u32)> {
    let mut uses: HashMap<(u32, u32), i32> = HashMap::new();
    for t in &mesh.triangles {
        for k in 0..3 {
            let a = t[k];
            let b = t[(k + 1) % 3];
            *uses.entry((a.min(b), a.max(b))).or_insert(0) += 1;
        }
    }
    let mut out = Vec::new();
    for t in &mesh.triangles {
        for k in 0..3 {
            let a = t[k];
            let b = t[(k + 1) % 3];
            if uses[&(a.min(b), a.max(b))] == 1 {
                out.push((a, b));
            }
        }
    }
    out
}

/// Chains boundary edges into closed loops. Non-manifold junctions abort the
/// loop they appear in; those holes are left open.
fn boundary_loops(mesh: &TriangleMesh) -> Vec<Vec<u32>> {
    let edges = boundary_edges(mesh);
    // A hole's rim runs opposite to the surface winding, so follow b -> a.
    let mut next: HashMap<u32, u32> = HashMap::new();
    let mut ambiguous = false;
    for &(a, b) in &edges {
        if next.insert(b, a).is_some() {
            ambiguous = true;
        }
    }
    if ambiguous {
        warn!("Non-manifold boundary detected; hole filling may be partial");
    }
    let mut visited: HashMap<u32, bool> = HashMap::new();
    let mut loops = Vec::new();
    for &(_, start) in &edges {
        if visited.get(&start).copied().unwrap_or(false) {
            continue;
        }
        let mut cycle = vec![start];
        visited.insert(start, true);
        let mut cur = start;
        loop {
            let Some(&n) = next.get(&cur) else {
                cycle.clear();
                break;
            };
            if n == start {
                break;
            }
            if visited.get(&n).copied().unwrap_or(false) {
                cycle.clear();
                break;
            }
            visited.insert(n, true);
            cycle.push(n);
            cur = n;
        }
        if cycle.len() >= 3 {
            loops.push(cycle);
        }
    }
    loops
}

/// Fills boundary loops by fanning triangles from the loop centroid.
///
/// Loops requiring more than `max_triangles` are left open: the budget is a
/// guard against capping genuinely open anatomy (a field-of-view truncation)
/// with a large artificial lid.
pub fn fill_holes(mesh: &mut TriangleMesh, max_triangles: usize) -> usize {
    let loops = boundary_loops(mesh);
    let mut filled = 0usize;
    for cycle in loops {
        if cycle.len() > max_triangles {
            debug!(
                "Leaving hole with {} rim vertices open (budget {})",
                cycle.len(),
                max_triangles
            );
            continue;
        }
        let mut centroid = [0.0f32; 3];
        for &i in &cycle {
            let v = mesh.vertices[i as usize];
            for a in 0..3 {
                centroid[a] += v[a];
            }
        }
        for c in &mut centroid {
            *c /= cycle.len() as f32;
        }
        let centre = mesh.vertices.len() as u32;
        mesh.vertices.push(centroid);
        for k in 0..cycle.len() {
            let a = cycle[k];
            let b = cycle[(k + 1) % cycle.len()];
            mesh.triangles.push([a, b, centre]);
        }
        filled += 1;
    }
    if filled > 0 {
        mesh.normals = None;
        debug!("Filled {filled} hole(s)");
    }
    filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::is_closed;

    /// Octahedron with one face removed: a triangular boundary loop.
    fn open_octahedron() -> TriangleMesh {
        TriangleMesh {
            vertices: vec![
                [1.0, 0.0, 0.0],
                [-1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, -1.0, 0.0],
                [0.0, 0.0, 1.0],
                [0.0, 0.0, -1.0],
            ],
            triangles: vec![
                // top half kept partially: remove [0, 2, 4]
                [2, 1, 4],
                [1, 3, 4],
                [3, 0, 4],
                [2, 0, 5],
                [1, 2, 5],
                [3, 1, 5],
                [0, 3, 5],
            ],
            normals: None,
        }
    }

    #[test]
    fn open_mesh_has_boundary_loop() {
        let m = open_octahedron();
        let loops = boundary_loops(&m);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].len(), 3);
    }

    #[test]
    fn fill_closes_the_mesh() {
        let mut m = open_octahedron();
        assert!(!is_closed(&m));
        let filled = fill_holes(&mut m, 80);
        assert_eq!(filled, 1);
        assert!(is_closed(&m));
    }

    #[test]
    fn oversized_hole_is_left_open() {
        let mut m = open_octahedron();
        let filled = fill_holes(&mut m, 2);
        assert_eq!(filled, 0);
        assert!(!is_closed(&m));
    }

    #[test]
    fn closed_mesh_is_untouched() {
        let mut m = open_octahedron();
        fill_holes(&mut m, 80);
        let faces = m.face_count();
        assert_eq!(fill_holes(&mut m, 80), 0);
        assert_eq!(m.face_count(), faces);
    }
}
