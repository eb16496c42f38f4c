use ndarray::{Array2, Array3};
use std::collections::VecDeque;

use crate::geometry::Mask;

// 6-connected neighbourhood offsets in (x, y, z).
const NEIGHBOURS_3D: [[i64; 3]; 6] = [
    [1, 0, 0],
    [-1, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [0, 0, 1],
    [0, 0, -1],
];

// 4-connected neighbourhood offsets in (x, y).
const NEIGHBOURS_2D: [[i64; 2]; 4] = [[1, 0], [-1, 0], [0, 1], [0, -1]];

fn erode_once(data: &Array3<u8>) -> Array3<u8> {
    let (nz, ny, nx) = data.dim();
    let mut out = data.clone();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if data[[z, y, x]] == 0 {
                    continue;
                }
                let mut keep = true;
                for d in NEIGHBOURS_3D {
                    let (xi, yi, zi) = (x as i64 + d[0], y as i64 + d[1], z as i64 + d[2]);
                    if xi < 0
                        || yi < 0
                        || zi < 0
                        || xi >= nx as i64
                        || yi >= ny as i64
                        || zi >= nz as i64
                        || data[[zi as usize, yi as usize, xi as usize]] == 0
                    {
                        keep = false;
                        break;
                    }
                }
                if !keep {
                    out[[z, y, x]] = 0;
                }
            }
        }
    }
    out
}

fn dilate_once(data: &Array3<u8>) -> Array3<u8> {
    let (nz, ny, nx) = data.dim();
    let mut out = data.clone();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if data[[z, y, x]] != 0 {
                    continue;
                }
                for d in NEIGHBOURS_3D {
                    let (xi, yi, zi) = (x as i64 + d[0], y as i64 + d[1], z as i64 + d[2]);
                    if xi >= 0
                        && yi >= 0
                        && zi >= 0
                        && xi < nx as i64
                        && yi < ny as i64
                        && zi < nz as i64
                        && data[[zi as usize, yi as usize, xi as usize]] != 0
                    {
                        out[[z, y, x]] = 1;
                        break;
                    }
                }
            }
        }
    }
    out
}

fn repeat<F: Fn(&Array3<u8>) -> Array3<u8>>(data: &Array3<u8>, n: usize, f: F) -> Array3<u8> {
    let mut out = data.clone();
    for _ in 0..n {
        out = f(&out);
    }
    out
}

pub fn erode(mask: &Mask, radius: usize) -> Mask {
    Mask {
        geometry: mask.geometry.clone(),
        data: repeat(&mask.data, radius, erode_once),
    }
}

pub fn dilate(mask: &Mask, radius: usize) -> Mask {
    Mask {
        geometry: mask.geometry.clone(),
        data: repeat(&mask.data, radius, dilate_once),
    }
}

/// Erosion followed by dilation; removes structures thinner than the radius.
pub fn open(mask: &Mask, radius: usize) -> Mask {
    dilate(&erode(mask, radius), radius)
}

/// Dilation followed by erosion; seals pits and gaps narrower than the radius.
pub fn close(mask: &Mask, radius: usize) -> Mask {
    erode(&dilate(mask, radius), radius)
}

/// Fills cavities not connected to the border background (6-connectivity).
pub fn fill_holes(mask: &Mask) -> Mask {
    let (nz, ny, nx) = mask.data.dim();
    let mut reached = Array3::<u8>::zeros((nz, ny, nx));
    let mut queue = VecDeque::new();
    let try_seed = |x: usize, y: usize, z: usize, queue: &mut VecDeque<[usize; 3]>| {
        if mask.data[[z, y, x]] == 0 {
            queue.push_back([x, y, z]);
        }
    };
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if x == 0 || y == 0 || z == 0 || x == nx - 1 || y == ny - 1 || z == nz - 1 {
                    try_seed(x, y, z, &mut queue);
                }
            }
        }
    }
    while let Some([x, y, z]) = queue.pop_front() {
        if reached[[z, y, x]] != 0 {
            continue;
        }
        reached[[z, y, x]] = 1;
        for d in NEIGHBOURS_3D {
            let (xi, yi, zi) = (x as i64 + d[0], y as i64 + d[1], z as i64 + d[2]);
            if xi >= 0
                && yi >= 0
                && zi >= 0
                && xi < nx as i64
                && yi < ny as i64
                && zi < nz as i64
            {
                let (xi, yi, zi) = (xi as usize, yi as usize, zi as usize);
                if mask.data[[zi, yi, xi]] == 0 && reached[[zi, yi, xi]] == 0 {
                    queue.push_back([xi, yi, zi]);
                }
            }
        }
    }
    let mut out = mask.clone();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if mask.data[[z, y, x]] == 0 && reached[[z, y, x]] == 0 {
                    out.data[[z, y, x]] = 1;
                }
            }
        }
    }
    out
}

/// Labels 6-connected foreground components; returns the label image and the
/// voxel count per label (label 0 is background and has count 0).
pub fn label_components(data: &Array3<u8>) -> (Array3<u32>, Vec<usize>) {
    let (nz, ny, nx) = data.dim();
    let mut labels = Array3::<u32>::zeros((nz, ny, nx));
    let mut sizes = vec![0usize];
    let mut next = 1u32;
    let mut queue = VecDeque::new();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                if data[[z, y, x]] == 0 || labels[[z, y, x]] != 0 {
                    continue;
                }
                let label = next;
                next += 1;
                sizes.push(0);
                labels[[z, y, x]] = label;
                queue.push_back([x, y, z]);
                while let Some([cx, cy, cz]) = queue.pop_front() {
                    sizes[label as usize] += 1;
                    for d in NEIGHBOURS_3D {
                        let (xi, yi, zi) =
                            (cx as i64 + d[0], cy as i64 + d[1], cz as i64 + d[2]);
                        if xi >= 0
                            && yi >= 0
                            && zi >= 0
                            && xi < nx as i64
                            && yi < ny as i64
                            && zi < nz as i64
                        {
                            let (xi, yi, zi) = (xi as usize, yi as usize, zi as usize);
                            if data[[zi, yi, xi]] != 0 && labels[[zi, yi, xi]] == 0 {
                                labels[[zi, yi, xi]] = label;
                                queue.push_back([xi, yi, zi]);
                            }
                        }
                    }
                }
            }
        }
    }
    (labels, sizes)
}

/// Keeps only the `k` largest connected components.
pub fn keep_top_components(mask: &Mask, k: usize) -> Mask {
    let (labels, sizes) = label_components(&mask.data);
    let mut order: Vec<u32> = (1..sizes.len() as u32).collect();
    order.sort_by_key(|&l| std::cmp::Reverse(sizes[l as usize]));
    order.truncate(k);
    let mut keep = vec![false; sizes.len()];
    for l in order {
        keep[l as usize] = true;
    }
    let mut out = mask.clone();
    ndarray::Zip::from(&mut out.data)
        .and(&labels)
        .for_each(|v, &l| {
            *v = u8::from(l != 0 && keep[l as usize]);
        });
    out
}

/// Keeps only the single largest connected component.
pub fn keep_largest_component(mask: &Mask) -> Mask {
    keep_top_components(mask, 1)
}

/// Drops components smaller than `min_size` voxels.
pub fn remove_small_objects(mask: &Mask, min_size: usize) -> Mask {
    let (labels, sizes) = label_components(&mask.data);
    let mut out = mask.clone();
    ndarray::Zip::from(&mut out.data)
        .and(&labels)
        .for_each(|v, &l| {
            *v = u8::from(l != 0 && sizes[l as usize] >= min_size);
        });
    out
}

// ---------------------------------------------------------------------------
// 2D variants, used by the slice-by-slice segmentation branch.
// ---------------------------------------------------------------------------

fn erode_once_2d(data: &Array2<u8>) -> Array2<u8> {
    let (ny, nx) = data.dim();
    let mut out = data.clone();
    for y in 0..ny {
        for x in 0..nx {
            if data[[y, x]] == 0 {
                continue;
            }
            for d in NEIGHBOURS_2D {
                let (xi, yi) = (x as i64 + d[0], y as i64 + d[1]);
                if xi < 0
                    || yi < 0
                    || xi >= nx as i64
                    || yi >= ny as i64
                    || data[[yi as usize, xi as usize]] == 0
                {
                    out[[y, x]] = 0;
                    break;
                }
            }
        }
    }
    out
}

fn dilate_once_2d(data: &Array2<u8>) -> Array2<u8> {
    let (ny, nx) = data.dim();
    let mut out = data.clone();
    for y in 0..ny {
        for x in 0..nx {
            if data[[y, x]] != 0 {
                continue;
            }
            for d in NEIGHBOURS_2D {
                let (xi, yi) = (x as i64 + d[0], y as i64 + d[1]);
                if xi >= 0
                    && yi >= 0
                    && xi < nx as i64
                    && yi < ny as i64
                    && data[[yi as usize, xi as usize]] != 0
                {
                    out[[y, x]] = 1;
                    break;
                }
            }
        }
    }
    out
}

pub fn open_2d(data: &Array2<u8>, radius: usize) -> Array2<u8> {
    let mut out = data.clone();
    for _ in 0..radius {
        out = erode_once_2d(&out);
    }
    for _ in 0..radius {
        out = dilate_once_2d(&out);
    }
    out
}

pub fn close_2d(data: &Array2<u8>, radius: usize) -> Array2<u8> {
    let mut out = data.clone();
    for _ in 0..radius {
        out = dilate_once_2d(&out);
    }
    for _ in 0..radius {
        out = erode_once_2d(&out);
    }
    out
}

/// Fills cavities in a single slice (4-connectivity background flood).
pub fn fill_holes_2d(data: &Array2<u8>) -> Array2<u8> {
    let (ny, nx) = data.dim();
    let mut reached = Array2::<u8>::zeros((ny, nx));
    let mut queue = VecDeque::new();
    for y in 0..ny {
        for x in 0..nx {
            if (x == 0 || y == 0 || x == nx - 1 || y == ny - 1) && data[[y, x]] == 0 {
                queue.push_back([x, y]);
            }
        }
    }
    while let Some([x, y]) = queue.pop_front() {
        if reached[[y, x]] != 0 {
            continue;
        }
        reached[[y, x]] = 1;
        for d in NEIGHBOURS_2D {
            let (xi, yi) = (x as i64 + d[0], y as i64 + d[1]);
            if xi >= 0 && yi >= 0 && xi < nx as i64 && yi < ny as i64 {
                let (xi, yi) = (xi as usize, yi as usize);
                if data[[yi, xi]] == 0 && reached[[yi, xi]] == 0 {
                    queue.push_back([xi, yi]);
                }
            }
        }
    }
    let mut out = data.clone();
    for y in 0..ny {
        for x in 0..nx {
            if data[[y, x]] == 0 && reached[[y, x]] == 0 {
                out[[y, x]] = 1;
            }
        }
    }
    out
}

/// Labels 4-connected components of one slice with their pixel counts.
pub fn label_components_2d(data: &Array2<u8>) -> (Array2<u32>, Vec<usize>) {
    let (ny, nx) = data.dim();
    let mut labels = Array2::<u32>::zeros((ny, nx));
    let mut sizes = vec![0usize];
    let mut next = 1u32;
    let mut queue = VecDeque::new();
    for y in 0..ny {
        for x in 0..nx {
            if data[[y, x]] == 0 || labels[[y, x]] != 0 {
                continue;
            }
            let label = next;
            next += 1;
            sizes.push(0);
            labels[[y, x]] = label;
            queue.push_back([x, y]);
            while let Some([cx, cy]) = queue.pop_front() {
                sizes[label as usize] += 1;
                for d in NEIGHBOURS_2D {
                    let (xi, yi) = (cx as i64 + d[0], cy as i64 + d[1]);
                    if xi >= 0 && yi >= 0 && xi < nx as i64 && yi < ny as i64 {
                        let (xi, yi) = (xi as usize, yi as usize);
                        if data[[yi, xi]] != 0 && labels[[yi, xi]] == 0 {
                            labels[[yi, xi]] = label;
                            queue.push_back([xi, yi]);
                        }
                    }
                }
            }
        }
    }
    (labels, sizes)
}

/// Keeps the `k` largest 4-connected components of one slice.
pub fn keep_top_components_2d(data: &Array2<u8>, k: usize) -> Array2<u8> {
    let (labels, sizes) = label_components_2d(data);
    let mut order: Vec<u32> = (1..sizes.len() as u32).collect();
    order.sort_by_key(|&l| std::cmp::Reverse(sizes[l as usize]));
    order.truncate(k);
    let mut keep = vec![false; sizes.len()];
    for l in order {
        keep[l as usize] = true;
    }
    let mut out = data.clone();
    ndarray::Zip::from(&mut out).and(&labels).for_each(|v, &l| {
        *v = u8::from(l != 0 && keep[l as usize]);
    });
    out
}
