use derive_builder::{Builder, UninitializedFieldError};
use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

use crate::DIRECTION_TOLERANCE;

/// Placement of a voxel grid in the patient (LPS) frame.
///
/// `dims` and `spacing` are in `(x, y, z)` order while the pixel arrays are
/// indexed `[z, y, x]`. The columns of `direction` are the patient-frame unit
/// vectors of the voxel x, y and z axes.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    /// Grid extents `(nx, ny, nz)`.
    pub dims: [usize; 3],
    /// Voxel spacing in millimetres, `(sx, sy, sz)`, all positive.
    pub spacing: [f64; 3],
    /// Patient-frame position of the voxel at index `(0, 0, 0)`, millimetres.
    pub origin: Vector3<f64>,
    /// Voxel-axis directions in the patient frame, one column per axis.
    pub direction: Matrix3<f64>,
}

impl Geometry {
    pub fn voxel_count(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Maps a (possibly fractional) voxel index `(i, j, k)` to patient
    /// coordinates in millimetres.
    pub fn index_to_patient(&self, index: [f64; 3]) -> Vector3<f64> {
        let scaled = Vector3::new(
            index[0] * self.spacing[0],
            index[1] * self.spacing[1],
            index[2] * self.spacing[2],
        );
        self.direction * scaled + self.origin
    }

    /// Checks that the direction columns are unit length and mutually
    /// orthogonal within [`DIRECTION_TOLERANCE`].
    pub fn direction_is_orthonormal(&self) -> bool {
        let d = &self.direction;
        for c in 0..3 {
            if (d.column(c).norm() - 1.0).abs() > DIRECTION_TOLERANCE {
                return false;
            }
        }
        for a in 0..3 {
            for b in (a + 1)..3 {
                if d.column(a).dot(&d.column(b)).abs() > DIRECTION_TOLERANCE {
                    return false;
                }
            }
        }
        true
    }

    /// True when the direction matrix is the identity to within `tol`; the
    /// canonical orientation every stage after assembly may assume.
    pub fn is_canonical(&self, tol: f64) -> bool {
        let eye = Matrix3::identity();
        (self.direction - eye).abs().max() <= tol
    }

    /// Mean of the two in-plane spacings, millimetres.
    pub fn mean_in_plane_spacing(&self) -> f64 {
        (self.spacing[0] + self.spacing[1]) / 2.0
    }

    /// Through-plane spacing divided by mean in-plane spacing.
    pub fn anisotropy_ratio(&self) -> f64 {
        let mean = self.mean_in_plane_spacing();
        if mean > 0.0 { self.spacing[2] / mean } else { f64::MAX }
    }

    /// Loose equality for geometry propagation checks (mask vs. parent).
    pub fn approx_eq(&self, other: &Geometry, tol: f64) -> bool {
        self.dims == other.dims
            && self
                .spacing
                .iter()
                .zip(other.spacing.iter())
                .all(|(a, b)| (a - b).abs() <= tol)
            && (self.origin - other.origin).abs().max() <= tol
            && (self.direction - other.direction).abs().max() <= tol
    }
}

/// A 3D scalar field placed in the patient frame.
///
/// Pixel data is stored `[z, y, x]`; geometry extents are `(x, y, z)`.
#[derive(Clone, Debug, Builder)]
#[builder(build_fn(validate = "check_volume", error = "VolumeBuildError"))]
pub struct Volume {
    pub geometry: Geometry,
    pub data: Array3<f32>,
}

impl Volume {
    pub fn dims(&self) -> [usize; 3] {
        self.geometry.dims
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.geometry.spacing
    }

    /// Value at voxel `(x, y, z)`.
    pub fn at(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[[z, y, x]]
    }

    pub fn min_max(&self) -> (f32, f32) {
        let mut lo = f32::MAX;
        let mut hi = f32::MIN;
        for &v in self.data.iter() {
            if v < lo {
                lo = v;
            }
            if v > hi {
                hi = v;
            }
        }
        if lo > hi { (0.0, 0.0) } else { (lo, hi) }
    }
}

#[derive(thiserror::Error, Clone, Debug)]
pub enum VolumeBuildError {
    #[error("UninitializedField: {0}")]
    UninitializedField(&'static str),
    #[error("Volume extents contain a zero dimension: {0:?}")]
    EmptyDimensions([usize; 3]),
    #[error("Non-positive voxel spacing: {0:?}")]
    NonPositiveSpacing([f64; 3]),
    #[error("Direction matrix is not orthonormal within tolerance")]
    SkewedDirection,
    #[error("Pixel array shape {actual:?} does not match extents {expected:?} (z, y, x)")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },
}

impl From<UninitializedFieldError> for VolumeBuildError {
    fn from(error: UninitializedFieldError) -> Self {
        Self::UninitializedField(error.field_name())
    }
}

fn check_volume(builder: &VolumeBuilder) -> Result<(), VolumeBuildError> {
    if let Some(geometry) = &builder.geometry {
        if geometry.dims.iter().any(|&d| d == 0) {
            return Err(VolumeBuildError::EmptyDimensions(geometry.dims));
        }
        if geometry.spacing.iter().any(|&s| s <= 0.0) {
            return Err(VolumeBuildError::NonPositiveSpacing(geometry.spacing));
        }
        if !geometry.direction_is_orthonormal() {
            return Err(VolumeBuildError::SkewedDirection);
        }
        if let Some(data) = &builder.data {
            let expected = [geometry.dims[2], geometry.dims[1], geometry.dims[0]];
            let shape = data.shape();
            let actual = [shape[0], shape[1], shape[2]];
            if expected != actual {
                return Err(VolumeBuildError::ShapeMismatch { expected, actual });
            }
        }
    }
    Ok(())
}

/// A binary labelling of a [`Volume`]'s grid.
///
/// Holds a copy of the parent geometry rather than a reference to the parent;
/// the link is metadata only.
#[derive(Clone, Debug)]
pub struct Mask {
    pub geometry: Geometry,
    pub data: Array3<u8>,
}

impl Mask {
    /// An all-zero mask on the given grid.
    pub fn zeros(geometry: Geometry) -> Self {
        let dims = geometry.dims;
        Self {
            geometry,
            data: Array3::zeros((dims[2], dims[1], dims[0])),
        }
    }

    /// Thresholds a volume at `level` (inclusive) into a mask on the same grid.
    pub fn from_threshold(volume: &Volume, level: f32) -> Self {
        let data = volume.data.mapv(|v| u8::from(v >= level));
        Self {
            geometry: volume.geometry.clone(),
            data,
        }
    }

    pub fn dims(&self) -> [usize; 3] {
        self.geometry.dims
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> bool {
        self.data[[z, y, x]] != 0
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, on: bool) {
        self.data[[z, y, x]] = u8::from(on);
    }

    /// Number of foreground voxels.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }

    /// Bounding box of the foreground as inclusive `(lo, hi)` in `(x, y, z)`
    /// index order, or `None` for an empty mask.
    pub fn bounding_box(&self) -> Option<([usize; 3], [usize; 3])> {
        let [nx, ny, nz] = self.dims();
        let mut lo = [usize::MAX; 3];
        let mut hi = [0usize; 3];
        let mut any = false;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    if self.data[[z, y, x]] != 0 {
                        any = true;
                        let idx = [x, y, z];
                        for a in 0..3 {
                            lo[a] = lo[a].min(idx[a]);
                            hi[a] = hi[a].max(idx[a]);
                        }
                    }
                }
            }
        }
        if any { Some((lo, hi)) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_geometry(dims: [usize; 3], spacing: [f64; 3]) -> Geometry {
        Geometry {
            dims,
            spacing,
            origin: Vector3::zeros(),
            direction: Matrix3::identity(),
        }
    }

    #[test]
    fn volume_build() {
        let g = identity_geometry([2, 3, 4], [1.0, 1.0, 2.0]);
        let r = VolumeBuilder::default()
            .geometry(g)
            .data(Array3::zeros((4, 3, 2)))
            .build();
        assert!(r.is_ok());
        let v = r.unwrap();
        assert_eq!(v.dims(), [2, 3, 4]);
        assert_eq!(v.geometry.voxel_count(), 24);
    }

    #[test]
    fn volume_build_uninitialized_field() {
        let r = VolumeBuilder::default().data(Array3::zeros((2, 2, 2))).build();
        match r.unwrap_err() {
            VolumeBuildError::UninitializedField(field) => assert_eq!("geometry", field),
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn volume_build_shape_mismatch() {
        let g = identity_geometry([2, 3, 4], [1.0; 3]);
        let r = VolumeBuilder::default()
            .geometry(g)
            .data(Array3::zeros((2, 3, 4)))
            .build();
        match r.unwrap_err() {
            VolumeBuildError::ShapeMismatch { expected, actual } => {
                assert_eq!(expected, [4, 3, 2]);
                assert_eq!(actual, [2, 3, 4]);
            }
            e => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn volume_build_rejects_skewed_direction() {
        let mut g = identity_geometry([2, 2, 2], [1.0; 3]);
        g.direction[(0, 1)] = 0.2;
        let r = VolumeBuilder::default()
            .geometry(g)
            .data(Array3::zeros((2, 2, 2)))
            .build();
        assert!(matches!(r.unwrap_err(), VolumeBuildError::SkewedDirection));
    }

    #[test]
    fn volume_build_rejects_zero_spacing() {
        let g = identity_geometry([2, 2, 2], [1.0, 0.0, 1.0]);
        let r = VolumeBuilder::default()
            .geometry(g)
            .data(Array3::zeros((2, 2, 2)))
            .build();
        assert!(matches!(
            r.unwrap_err(),
            VolumeBuildError::NonPositiveSpacing(_)
        ));
    }

    #[test]
    fn index_to_patient_applies_spacing_direction_origin() {
        let mut g = identity_geometry([4, 4, 4], [0.5, 0.5, 2.0]);
        g.origin = Vector3::new(10.0, -5.0, 3.0);
        let p = g.index_to_patient([2.0, 4.0, 1.0]);
        assert!((p - Vector3::new(11.0, -3.0, 5.0)).norm() < 1e-12);
    }

    #[test]
    fn mask_shares_parent_geometry() {
        let g = identity_geometry([3, 3, 3], [1.0; 3]);
        let v = VolumeBuilder::default()
            .geometry(g)
            .data(Array3::from_elem((3, 3, 3), 0.7))
            .build()
            .unwrap();
        let m = Mask::from_threshold(&v, 0.5);
        assert!(m.geometry.approx_eq(&v.geometry, 1e-12));
        assert_eq!(m.count(), 27);
    }

    #[test]
    fn bounding_box_of_single_voxel() {
        let g = identity_geometry([5, 5, 5], [1.0; 3]);
        let mut m = Mask::zeros(g);
        m.set(1, 2, 3, true);
        let (lo, hi) = m.bounding_box().unwrap();
        assert_eq!(lo, [1, 2, 3]);
        assert_eq!(hi, [1, 2, 3]);
    }
}
