use ndarray::Array3;

/// Squared Euclidean distance transform of one row of sampled values, with
/// samples spaced `step` millimetres apart (Felzenszwalb-Huttenlocher lower
/// envelope of parabolas).
fn edt_1d(f: &[f64], step: f64, out: &mut [f64]) {
    let n = f.len();
    if n == 0 {
        return;
    }
    let mut v = vec![0usize; n]; // parabola sites
    let mut z = vec![0.0f64; n + 1]; // envelope boundaries
    let mut k = 0usize;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    let x = |i: usize| i as f64 * step;
    for q in 1..n {
        if f[q] == f64::INFINITY && f[v[k]] == f64::INFINITY {
            continue;
        }
        let mut s;
        loop {
            let p = v[k];
            s = ((f[q] + x(q) * x(q)) - (f[p] + x(p) * x(p))) / (2.0 * x(q) - 2.0 * x(p));
            if s <= z[k] && k > 0 {
                k -= 1;
            } else {
                break;
            }
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = f64::INFINITY;
    }
    let mut k = 0usize;
    for q in 0..n {
        while z[k + 1] < x(q) {
            k += 1;
        }
        let d = x(q) - x(v[k]);
        out[q] = d * d + f[v[k]];
    }
}

/// Squared distance (mm^2) from every voxel to the nearest foreground voxel.
fn squared_distance_to(mask: &Array3<u8>, spacing: [f64; 3], foreground: u8) -> Array3<f64> {
    let (nz, ny, nx) = mask.dim();
    let mut dist = Array3::<f64>::zeros((nz, ny, nx));
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                dist[[z, y, x]] = if mask[[z, y, x]] == foreground {
                    0.0
                } else {
                    f64::INFINITY
                };
            }
        }
    }
    // Pass along x.
    let mut row = vec![0.0f64; nx];
    let mut out = vec![0.0f64; nx];
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                row[x] = dist[[z, y, x]];
            }
            edt_1d(&row, spacing[0], &mut out);
            for x in 0..nx {
                dist[[z, y, x]] = out[x];
            }
        }
    }
    // Pass along y.
    let mut row = vec![0.0f64; ny];
    let mut out = vec![0.0f64; ny];
    for z in 0..nz {
        for x in 0..nx {
            for y in 0..ny {
                row[y] = dist[[z, y, x]];
            }
            edt_1d(&row, spacing[1], &mut out);
            for y in 0..ny {
                dist[[z, y, x]] = out[y];
            }
        }
    }
    // Pass along z.
    let mut row = vec![0.0f64; nz];
    let mut out = vec![0.0f64; nz];
    for y in 0..ny {
        for x in 0..nx {
            for z in 0..nz {
                row[z] = dist[[z, y, x]];
            }
            edt_1d(&row, spacing[2], &mut out);
            for z in 0..nz {
                dist[[z, y, x]] = out[z];
            }
        }
    }
    dist
}

/// Signed distance field of a binary mask in millimetres: positive inside,
/// negative outside, zero crossing on the boundary.
///
/// `sdf = EDT(inside) - EDT(outside)` with the transform weighted by the
/// voxel spacing, so anisotropic grids produce metrically correct distances.
pub fn signed_distance_field(mask: &Array3<u8>, spacing: [f64; 3]) -> Array3<f32> {
    let inside = squared_distance_to(mask, spacing, 1);
    let outside = squared_distance_to(mask, spacing, 0);
    let (nz, ny, nx) = mask.dim();
    let mut sdf = Array3::<f32>::zeros((nz, ny, nx));
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                // Distance to the outside minus distance to the inside:
                // interior voxels are a positive distance from the background.
                let d_in = inside[[z, y, x]].sqrt(); // 0 inside the mask
                let d_out = outside[[z, y, x]].sqrt(); // 0 outside the mask
                sdf[[z, y, x]] = (d_out - d_in) as f32;
            }
        }
    }
    sdf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edt_single_seed() {
        let f = vec![f64::INFINITY, 0.0, f64::INFINITY, f64::INFINITY];
        let mut out = vec![0.0; 4];
        edt_1d(&f, 2.0, &mut out);
        assert_eq!(out, vec![4.0, 0.0, 4.0, 16.0]);
    }

    #[test]
    fn edt_two_seeds() {
        let f = vec![0.0, f64::INFINITY, f64::INFINITY, 0.0];
        let mut out = vec![0.0; 4];
        edt_1d(&f, 1.0, &mut out);
        assert_eq!(out, vec![0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn sdf_sign_convention() {
        let mut mask = Array3::<u8>::zeros((5, 5, 5));
        for z in 1..4 {
            for y in 1..4 {
                for x in 1..4 {
                    mask[[z, y, x]] = 1;
                }
            }
        }
        let sdf = signed_distance_field(&mask, [1.0, 1.0, 1.0]);
        assert!(sdf[[2, 2, 2]] > 0.0);
        assert!(sdf[[0, 0, 0]] < 0.0);
        // Centre is deeper inside than a face voxel.
        assert!(sdf[[2, 2, 2]] > sdf[[1, 2, 2]]);
    }

    #[test]
    fn sdf_scales_with_spacing() {
        let mut mask = Array3::<u8>::zeros((5, 1, 1));
        mask[[2, 0, 0]] = 1;
        let sdf = signed_distance_field(&mask, [1.0, 1.0, 3.0]);
        // One z-step from the mask is 3 mm outside.
        assert!((sdf[[1, 0, 0]] + 3.0).abs() < 1e-5);
        assert!((sdf[[0, 0, 0]] + 6.0).abs() < 1e-5);
    }
}
