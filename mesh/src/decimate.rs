use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use tracing::{debug, warn};

use crate::cleanup::remove_degenerate;
use crate::{Error, Result, TriangleMesh};

/// Symmetric 4x4 quadric stored as its 10 unique coefficients.
#[derive(Clone, Copy, Debug, Default)]
struct Quadric {
    q: [f64; 10], // a11 a12 a13 a14 a22 a23 a24 a33 a34 a44
}

impl Quadric {
    fn from_plane(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self {
            q: [
                a * a,
                a * b,
                a * c,
                a * d,
                b * b,
                b * c,
                b * d,
                c * c,
                c * d,
                d * d,
            ],
        }
    }

    fn add(&mut self, other: &Quadric) {
        for i in 0..10 {
            self.q[i] += other.q[i];
        }
    }

    /// Error `v^T Q v` for a homogeneous point `(x, y, z, 1)`.
    fn error(&self, p: [f64; 3]) -> f64 {
        let [x, y, z] = p;
        let q = &self.q;
        q[0] * x * x
            + 2.0 * q[1] * x * y
            + 2.0 * q[2] * x * z
            + 2.0 * q[3] * x
            + q[4] * y * y
            + 2.0 * q[5] * y * z
            + 2.0 * q[6] * y
            + q[7] * z * z
            + 2.0 * q[8] * z
            + q[9]
    }
}

fn face_quadric(a: [f32; 3], b: [f32; 3], c: [f32; 3]) -> Option<Quadric> {
    let a = [f64::from(a[0]), f64::from(a[1]), f64::from(a[2])];
    let b = [f64::from(b[0]), f64::from(b[1]), f64::from(b[2])];
    let c = [f64::from(c[0]), f64::from(c[1]), f64::from(c[2])];
    let e1 = [b[0] - a[0], b[1] - a[1], b[2] - a[2]];
    let e2 = [c[0] - a[0], c[1] - a[1], c[2] - a[2]];
    let mut n = [
        e1[1] * e2[2] - e1[2] * e2[1],
        e1[2] * e2[0] - e1[0] * e2[2],
        e1[0] * e2[1] - e1[1] * e2[0],
    ];
    let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if len < 1e-18 {
        return None;
    }
    for v in &mut n {
        *v /= len;
    }
    let d = -(n[0] * a[0] + n[1] * a[1] + n[2] * a[2]);
    Some(Quadric::from_plane(n[0], n[1], n[2], d))
}

#[derive(PartialEq)]
struct Candidate {
    cost: f64,
    a: u32,
    b: u32,
    /// Generation stamps so stale heap entries can be discarded.
    gen_a: u32,
    gen_b: u32,
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| (self.a, self.b).cmp(&(other.a, other.b)))
    }
}

/// Quadric-error edge-collapse simplification toward `target_faces`.
///
/// Collapses the cheapest edge repeatedly, placing the merged vertex at the
/// midpoint-or-endpoint with the smallest quadric error. Stops when the
/// target is reached or no further collapse is possible.
pub fn quadric_decimate(mesh: &TriangleMesh, target_faces: usize) -> Result<TriangleMesh> {
    if mesh.face_count() <= target_faces {
        return Ok(mesh.clone());
    }
    let n = mesh.vertices.len();
    let mut quadrics = vec![Quadric::default(); n];
    for t in &mesh.triangles {
        let Some(q) = face_quadric(
            mesh.vertices[t[0] as usize],
            mesh.vertices[t[1] as usize],
            mesh.vertices[t[2] as usize],
        ) else {
            continue;
        };
        for &i in t {
            quadrics[i as usize].add(&q);
        }
    }

    let mut positions = mesh.vertices.clone();
    let mut triangles = mesh.triangles.clone();
    // Union-find over collapsed vertices.
    let mut merged: Vec<u32> = (0..n as u32).collect();
    let mut generation = vec![0u32; n];
    fn resolve(merged: &[u32], mut i: u32) -> u32 {
        while merged[i as usize] != i {
            i = merged[i as usize];
        }
        i
    }

    let mut edges: HashSet<(u32, u32)> = HashSet::new();
    for t in &triangles {
        for k in 0..3 {
            let a = t[k];
            let b = t[(k + 1) % 3];
            edges.insert((a.min(b), a.max(b)));
        }
    }

    let best_placement = |qa: &Quadric, qb: &Quadric, pa: [f32; 3], pb: [f32; 3]| {
        let mut q = *qa;
        q.add(qb);
        let mid = [
            (f64::from(pa[0]) + f64::from(pb[0])) / 2.0,
            (f64::from(pa[1]) + f64::from(pb[1])) / 2.0,
            (f64::from(pa[2]) + f64::from(pb[2])) / 2.0,
        ];
        let fa = [f64::from(pa[0]), f64::from(pa[1]), f64::from(pa[2])];
        let fb = [f64::from(pb[0]), f64::from(pb[1]), f64::from(pb[2])];
        let candidates = [mid, fa, fb];
        let mut best = candidates[0];
        let mut best_cost = f64::MAX;
        for c in candidates {
            let cost = q.error(c);
            if cost < best_cost {
                best_cost = cost;
                best = c;
            }
        }
        (best, best_cost)
    };

    let mut heap: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
    for &(a, b) in &edges {
        let (_, cost) = best_placement(
            &quadrics[a as usize],
            &quadrics[b as usize],
            positions[a as usize],
            positions[b as usize],
        );
        heap.push(Reverse(Candidate {
            cost,
            a,
            b,
            gen_a: 0,
            gen_b: 0,
        }));
    }

    let mut live_faces = triangles.len();
    while live_faces > target_faces {
        let Some(Reverse(candidate)) = heap.pop() else {
            break;
        };
        let a = resolve(&merged, candidate.a);
        let b = resolve(&merged, candidate.b);
        if a == b
            || generation[candidate.a as usize] != candidate.gen_a
            || generation[candidate.b as usize] != candidate.gen_b
        {
            continue;
        }
        let (placement, _) = best_placement(
            &quadrics[a as usize],
            &quadrics[b as usize],
            positions[a as usize],
            positions[b as usize],
        );
        // Collapse b into a.
        merged[b as usize] = a;
        positions[a as usize] = [
            placement[0] as f32,
            placement[1] as f32,
            placement[2] as f32,
        ];
        let qb = quadrics[b as usize];
        quadrics[a as usize].add(&qb);
        generation[a as usize] += 1;
        generation[b as usize] += 1;

        // Count faces that die (both endpoints present) and requeue edges of a.
        let mut neighbour_edges: HashSet<(u32, u32)> = HashSet::new();
        live_faces = 0;
        for t in &triangles {
            let r = [
                resolve(&merged, t[0]),
                resolve(&merged, t[1]),
                resolve(&merged, t[2]),
            ];
            if r[0] == r[1] || r[1] == r[2] || r[0] == r[2] {
                continue;
            }
            live_faces += 1;
            for k in 0..3 {
                let u = r[k];
                let v = r[(k + 1) % 3];
                if u == a || v == a {
                    neighbour_edges.insert((u.min(v), u.max(v)));
                }
            }
        }
        for (u, v) in neighbour_edges {
            let (_, cost) = best_placement(
                &quadrics[u as usize],
                &quadrics[v as usize],
                positions[u as usize],
                positions[v as usize],
            );
            heap.push(Reverse(Candidate {
                cost,
                a: u,
                b: v,
                gen_a: generation[u as usize],
                gen_b: generation[v as usize],
            }));
        }
    }

    for t in &mut triangles {
        for i in t.iter_mut() {
            *i = resolve(&merged, *i);
        }
    }
    let out = remove_degenerate(&TriangleMesh {
        vertices: positions,
        triangles,
        normals: None,
    });
    if out.is_empty() {
        return Err(Error::Decimation(
            "simplification collapsed the mesh away".into(),
        ));
    }
    if out.face_count() > mesh.face_count() {
        warn!("Decimation did not reduce the mesh");
    }
    debug!(
        "Decimated {} -> {} faces (target {})",
        mesh.face_count(),
        out.face_count(),
        target_faces
    );
    Ok(out)
}
