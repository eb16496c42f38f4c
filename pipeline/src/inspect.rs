use dicom_dictionary_std::tags;
use dicom_object::DefaultDicomObject;
use dicom_pixeldata::PixelDecoder;
use nalgebra::Vector3;
use ndarray::Array2;
use tracing::debug;

use crate::error::{Error, Result};
use crate::progress::ProgressLog;
use crate::storage::ObjectStore;

const STAGE: &str = "inspect";

/// Cosine tolerance when bucketing slices by normal direction.
const ORIENTATION_COS_EPS: f64 = 1e-3;

/// Through-plane spacing assumed when no metadata or positions resolve it.
const FALLBACK_Z_SPACING: f64 = 4.0;

/// One decoded cross-sectional slice with the metadata the pipeline needs.
#[derive(Clone, Debug)]
pub struct Slice {
    /// Object-store key the slice was read from.
    pub key: String,
    pub series_uid: String,
    pub rows: usize,
    pub columns: usize,
    /// In-plane spacing `(sx, sy)` = (column spacing, row spacing), mm.
    pub pixel_spacing: [f64; 2],
    /// Patient position of the first transmitted pixel (LPS, mm).
    pub position: Option<Vector3<f64>>,
    /// Row and column direction cosines in LPS. Slices missing orientation
    /// are retained; downstream ordering falls back to the instance index.
    pub orientation: Option<(Vector3<f64>, Vector3<f64>)>,
    pub slice_thickness: Option<f64>,
    pub spacing_between_slices: Option<f64>,
    pub series_description: String,
    pub image_type: String,
    pub instance_number: i64,
    /// Decoded pixels, `(rows, columns)`.
    pub pixels: Array2<f32>,
}

impl Slice {
    /// Slice normal: cross product of the row and column axes.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        let (u, v) = self.orientation?;
        let n = u.cross(&v);
        let len = n.norm();
        if len < 1e-6 { None } else { Some(n / len) }
    }

    pub fn is_localizer(&self) -> bool {
        let upper = self.image_type.to_ascii_uppercase();
        upper.contains("LOCALIZER") || upper.contains("SCOUT")
    }
}

/// Slices of one series sharing one orientation, ordered as received.
#[derive(Clone, Debug)]
pub struct SeriesStack {
    pub series_uid: String,
    pub slices: Vec<Slice>,
}

impl SeriesStack {
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn normal(&self) -> Option<Vector3<f64>> {
        self.slices.iter().find_map(|s| s.normal())
    }

    pub fn slice_thickness(&self) -> Option<f64> {
        self.slices.iter().find_map(|s| s.slice_thickness)
    }

    /// Effective through-plane spacing: `SliceThickness`, then
    /// `SpacingBetweenSlices`, then the median position delta along the
    /// normal, then a conservative default.
    pub fn effective_z_spacing(&self) -> f64 {
        if let Some(t) = self.slice_thickness() {
            if t > 0.0 {
                return t;
            }
        }
        if let Some(s) = self.slices.iter().find_map(|s| s.spacing_between_slices) {
            if s > 0.0 {
                return s;
            }
        }
        if let Some(m) = self.median_position_delta() {
            if m > 0.0 {
                return m;
            }
        }
        FALLBACK_Z_SPACING
    }

    /// Median |delta| of slice-position projections along the stack normal.
    pub fn median_position_delta(&self) -> Option<f64> {
        let n = self.normal()?;
        let mut projections: Vec<f64> = self
            .slices
            .iter()
            .filter_map(|s| s.position.map(|p| n.dot(&p)))
            .collect();
        if projections.len() < 2 {
            return None;
        }
        projections.sort_by(|a, b| a.total_cmp(b));
        let mut deltas: Vec<f64> = projections.windows(2).map(|w| w[1] - w[0]).collect();
        deltas.sort_by(|a, b| a.total_cmp(b));
        Some(deltas[deltas.len() / 2])
    }

    pub fn mean_in_plane_spacing(&self) -> f64 {
        let s = self.slices[0].pixel_spacing;
        (s[0] + s[1]) / 2.0
    }

    pub fn min_in_plane_spacing(&self) -> f64 {
        let s = self.slices[0].pixel_spacing;
        s[0].min(s[1])
    }
}

fn string_of(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().trim_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty())
}

fn floats_of(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> Option<Vec<f64>> {
    let raw = obj.element(tag).ok()?.to_str().ok()?.to_string();
    let values: Vec<f64> = raw
        .split('\\')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .collect();
    if values.is_empty() { None } else { Some(values) }
}

fn int_of(obj: &DefaultDicomObject, tag: dicom_core::Tag) -> Option<i64> {
    obj.element(tag).ok().and_then(|e| e.to_int::<i64>().ok())
}

/// Parses one slice from an encoded DICOM blob, decoding its pixel payload.
pub fn parse_slice(key: &str, bytes: &[u8]) -> std::result::Result<Slice, String> {
    let obj =
        mri_recon_common::dicom::from_bytes(bytes).map_err(|e| format!("unreadable: {e}"))?;

    let series_uid = string_of(&obj, tags::SERIES_INSTANCE_UID)
        .ok_or_else(|| "missing SeriesInstanceUID".to_string())?;
    let rows = int_of(&obj, tags::ROWS).ok_or_else(|| "missing Rows".to_string())? as usize;
    let columns =
        int_of(&obj, tags::COLUMNS).ok_or_else(|| "missing Columns".to_string())? as usize;
    if rows == 0 || columns == 0 {
        return Err(format!("degenerate matrix {columns}x{rows}"));
    }

    // PixelSpacing is (row spacing, column spacing); store as (sx, sy).
    let pixel_spacing = floats_of(&obj, tags::PIXEL_SPACING)
        .filter(|v| v.len() >= 2 && v[0] > 0.0 && v[1] > 0.0)
        .map(|v| [v[1], v[0]])
        .unwrap_or([1.0, 1.0]);

    let position = floats_of(&obj, tags::IMAGE_POSITION_PATIENT)
        .filter(|v| v.len() >= 3)
        .map(|v| Vector3::new(v[0], v[1], v[2]));

    let orientation = floats_of(&obj, tags::IMAGE_ORIENTATION_PATIENT)
        .filter(|v| v.len() >= 6)
        .map(|v| {
            (
                Vector3::new(v[0], v[1], v[2]),
                Vector3::new(v[3], v[4], v[5]),
            )
        });

    let decoded = obj
        .decode_pixel_data()
        .map_err(|e| format!("pixel decode failed: {e}"))?;
    let values: Vec<f32> = decoded
        .to_vec()
        .map_err(|e| format!("pixel conversion failed: {e}"))?;
    if values.len() < rows * columns {
        return Err(format!(
            "pixel payload too short: {} < {}",
            values.len(),
            rows * columns
        ));
    }
    let pixels = Array2::from_shape_vec((rows, columns), values[..rows * columns].to_vec())
        .map_err(|e| format!("pixel reshape failed: {e}"))?;

    Ok(Slice {
        key: key.to_string(),
        series_uid,
        rows,
        columns,
        pixel_spacing,
        position,
        orientation,
        slice_thickness: floats_of(&obj, tags::SLICE_THICKNESS).map(|v| v[0]),
        spacing_between_slices: floats_of(&obj, tags::SPACING_BETWEEN_SLICES).map(|v| v[0]),
        series_description: string_of(&obj, tags::SERIES_DESCRIPTION).unwrap_or_default(),
        image_type: string_of(&obj, tags::IMAGE_TYPE).unwrap_or_default(),
        instance_number: int_of(&obj, tags::INSTANCE_NUMBER).unwrap_or(0),
        pixels,
    })
}

/// Buckets one series' slices by normal direction. Slices without
/// orientation form their own trailing bucket.
pub fn split_by_orientation(series_uid: &str, slices: Vec<Slice>) -> Vec<SeriesStack> {
    let mut oriented: Vec<(Vector3<f64>, Vec<Slice>)> = Vec::new();
    let mut unoriented: Vec<Slice> = Vec::new();
    for slice in slices {
        match slice.normal() {
            Some(n) => {
                let mut placed = false;
                for (group_normal, group) in &mut oriented {
                    if n.dot(group_normal).abs() > 1.0 - ORIENTATION_COS_EPS {
                        group.push(slice.clone());
                        placed = true;
                        break;
                    }
                }
                if !placed {
                    oriented.push((n, vec![slice]));
                }
            }
            None => unoriented.push(slice),
        }
    }
    let mut stacks: Vec<SeriesStack> = oriented
        .into_iter()
        .map(|(_, slices)| SeriesStack {
            series_uid: series_uid.to_string(),
            slices,
        })
        .collect();
    if !unoriented.is_empty() {
        stacks.push(SeriesStack {
            series_uid: series_uid.to_string(),
            slices: unoriented,
        });
    }
    stacks
}

/// Verifies intra-series geometry consistency: matrix size, in-plane spacing
/// and orientation must match the first slice.
pub fn validate_geometry(stack: &SeriesStack) -> Result<()> {
    let first = &stack.slices[0];
    for slice in &stack.slices[1..] {
        if slice.rows != first.rows || slice.columns != first.columns {
            return Err(Error::InconsistentSeries {
                series_uid: stack.series_uid.clone(),
                message: format!("matrix size mismatch in {}", slice.key),
            });
        }
        let ds = [
            (slice.pixel_spacing[0] - first.pixel_spacing[0]).abs(),
            (slice.pixel_spacing[1] - first.pixel_spacing[1]).abs(),
        ];
        if ds[0] > 1e-6 || ds[1] > 1e-6 {
            return Err(Error::InconsistentSeries {
                series_uid: stack.series_uid.clone(),
                message: format!("pixel spacing mismatch in {}", slice.key),
            });
        }
        if let (Some((u0, v0)), Some((u1, v1))) = (first.orientation, slice.orientation) {
            if u0.dot(&u1) < 1.0 - ORIENTATION_COS_EPS || v0.dot(&v1) < 1.0 - ORIENTATION_COS_EPS
            {
                return Err(Error::InconsistentSeries {
                    series_uid: stack.series_uid.clone(),
                    message: format!("orientation mismatch in {}", slice.key),
                });
            }
        }
    }
    Ok(())
}

/// Reads every input blob, parses and groups slices into orientation-split
/// series stacks. Localizer/scout slices are dropped; unreadable blobs are
/// logged and skipped. Fails only when nothing readable remains.
pub fn inspect(
    store: &dyn ObjectStore,
    keys: &[String],
    log: &mut ProgressLog,
) -> Result<Vec<SeriesStack>> {
    let mut by_series: Vec<(String, Vec<Slice>)> = Vec::new();
    let mut readable = 0usize;
    for key in keys {
        let Some(bytes) = store.get(key)? else {
            log.recoverable(STAGE, format!("blob missing: {key}"));
            continue;
        };
        let slice = match parse_slice(key, &bytes) {
            Ok(s) => s,
            Err(message) => {
                log.recoverable(STAGE, format!("unreadable slice {key}: {message}"));
                continue;
            }
        };
        readable += 1;
        if slice.is_localizer() {
            log.info(STAGE, format!("dropping localizer/scout slice: {key}"));
            continue;
        }
        debug!(
            "Slice {key}: series {}, {}x{}, spacing {:?}",
            slice.series_uid, slice.columns, slice.rows, slice.pixel_spacing
        );
        match by_series.iter_mut().find(|(uid, _)| *uid == slice.series_uid) {
            Some((_, slices)) => slices.push(slice),
            None => by_series.push((slice.series_uid.clone(), vec![slice])),
        }
    }
    if readable == 0 {
        return Err(Error::InvalidInput("no readable slices".into()));
    }

    let mut stacks = Vec::new();
    for (uid, slices) in by_series {
        stacks.extend(split_by_orientation(&uid, slices));
    }
    if stacks.is_empty() {
        return Err(Error::InvalidInput(
            "no series survives localizer filtering".into(),
        ));
    }
    log.info(
        STAGE,
        format!(
            "{} input blob(s) -> {} orientation stack(s): {:?}",
            keys.len(),
            stacks.len(),
            stacks
                .iter()
                .map(|s| format!("{}..x{}", truncate_uid(&s.series_uid), s.len()))
                .collect::<Vec<_>>()
        ),
    );
    Ok(stacks)
}

pub(crate) fn truncate_uid(uid: &str) -> &str {
    &uid[..uid.len().min(16)]
}
