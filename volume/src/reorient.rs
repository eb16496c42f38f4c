use nalgebra::Matrix3;
use ndarray::Array3;
use tracing::debug;

use crate::geometry::{Geometry, Volume};

/// Axis permutation and flips that bring a direction matrix to near-identity.
struct AxisMap {
    /// `source[a]` is the input voxel axis that becomes output axis `a` (x, y, z order).
    source: [usize; 3],
    /// Whether the source axis is traversed in reverse.
    flip: [bool; 3],
}

fn solve_axis_map(direction: &Matrix3<f64>) -> AxisMap {
    let mut source = [0usize; 3];
    let mut flip = [false; 3];
    let mut taken = [false; 3];
    // Assign voxel axes to patient axes greedily by dominant component.
    for patient_axis in 0..3 {
        let mut best = usize::MAX;
        let mut best_mag = -1.0;
        for voxel_axis in 0..3 {
            if taken[voxel_axis] {
                continue;
            }
            let mag = direction[(patient_axis, voxel_axis)].abs();
            if mag > best_mag {
                best_mag = mag;
                best = voxel_axis;
            }
        }
        taken[best] = true;
        source[patient_axis] = best;
        flip[patient_axis] = direction[(patient_axis, best)] < 0.0;
    }
    AxisMap { source, flip }
}

fn is_trivial(map: &AxisMap) -> bool {
    map.source == [0, 1, 2] && map.flip == [false; 3]
}

fn remap_geometry(geometry: &Geometry, map: &AxisMap) -> Geometry {
    let mut dims = [0usize; 3];
    let mut spacing = [0.0f64; 3];
    let mut direction = Matrix3::zeros();
    // Index of the input voxel that becomes output (0, 0, 0).
    let mut corner = [0.0f64; 3];
    for a in 0..3 {
        let s = map.source[a];
        dims[a] = geometry.dims[s];
        spacing[a] = geometry.spacing[s];
        let sign = if map.flip[a] { -1.0 } else { 1.0 };
        direction.set_column(a, &(geometry.direction.column(s) * sign));
        if map.flip[a] {
            corner[s] = (geometry.dims[s] - 1) as f64;
        }
    }
    let origin = geometry.index_to_patient(corner);
    Geometry {
        dims,
        spacing,
        origin,
        direction,
    }
}

fn remap_array<T: Copy + Default>(data: &Array3<T>, dims_out: [usize; 3], map: &AxisMap) -> Array3<T> {
    let mut out = Array3::<T>::default((dims_out[2], dims_out[1], dims_out[0]));
    let [nx, ny, nz] = dims_out;
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let idx_out = [x, y, z];
                // Input index in (x, y, z) order.
                let mut idx_in = [0usize; 3];
                for a in 0..3 {
                    let s = map.source[a];
                    idx_in[s] = if map.flip[a] {
                        dims_out[a] - 1 - idx_out[a]
                    } else {
                        idx_out[a]
                    };
                }
                out[[z, y, x]] = data[[idx_in[2], idx_in[1], idx_in[0]]];
            }
        }
    }
    out
}

/// Reorients a volume so its direction matrix is near identity in the LPS
/// frame (voxel x toward +L, y toward +P, z toward +S).
///
/// Applying the function to an already-canonical volume returns it unchanged.
pub fn reorient_to_canonical(volume: &Volume) -> Volume {
    let map = solve_axis_map(&volume.geometry.direction);
    if is_trivial(&map) {
        return volume.clone();
    }
    debug!(
        "Reorienting: source axes {:?}, flips {:?}",
        map.source, map.flip
    );
    let geometry = remap_geometry(&volume.geometry, &map);
    let data = remap_array(&volume.data, geometry.dims, &map);
    Volume { geometry, data }
}
