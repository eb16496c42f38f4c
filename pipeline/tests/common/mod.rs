use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_dictionary_std::uids::MR_IMAGE_STORAGE;
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use std::path::Path;

/// Geometry and content of one synthetic series.
#[derive(Clone, Debug)]
pub struct SeriesSpec {
    pub series_uid: String,
    pub slice_count: usize,
    pub rows: usize,
    pub columns: usize,
    /// (row spacing, column spacing) in mm, DICOM order.
    pub pixel_spacing: [f64; 2],
    pub slice_thickness: f64,
    pub series_description: String,
    pub image_type: String,
    /// Body cylinder radius in mm; 0 disables the phantom (all background).
    pub body_radius_mm: f64,
    /// Dark-core cylinder radius in mm.
    pub core_radius_mm: f64,
}

impl SeriesSpec {
    pub fn volumetric(series_uid: &str, slice_count: usize) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            slice_count,
            rows: 32,
            columns: 32,
            pixel_spacing: [1.0, 1.0],
            slice_thickness: 1.0,
            series_description: "T1 3D MPRAGE".to_string(),
            image_type: "ORIGINAL\\PRIMARY\\M\\ND".to_string(),
            body_radius_mm: 12.0,
            core_radius_mm: 3.0,
        }
    }

    pub fn thick_stack(series_uid: &str, slice_count: usize) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            slice_count,
            rows: 48,
            columns: 48,
            pixel_spacing: [0.5, 0.5],
            slice_thickness: 5.0,
            series_description: "T2 TSE AX".to_string(),
            image_type: "ORIGINAL\\PRIMARY\\M\\ND".to_string(),
            body_radius_mm: 10.5,
            core_radius_mm: 2.5,
        }
    }

    pub fn localizer(series_uid: &str) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            slice_count: 3,
            rows: 16,
            columns: 16,
            pixel_spacing: [2.0, 2.0],
            slice_thickness: 8.0,
            series_description: "SCOUT".to_string(),
            image_type: "ORIGINAL\\PRIMARY\\LOCALIZER".to_string(),
            body_radius_mm: 10.0,
            core_radius_mm: 0.0,
        }
    }
}

fn decimal(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v}"))
        .collect::<Vec<_>>()
        .join("\\")
}

/// Cylinder phantom intensity at in-plane position (mm from slice centre):
/// bright body, dark core, near-zero background.
fn phantom_value(spec: &SeriesSpec, dx_mm: f64, dy_mm: f64) -> u16 {
    if spec.body_radius_mm <= 0.0 {
        return 10;
    }
    let d = (dx_mm * dx_mm + dy_mm * dy_mm).sqrt();
    if spec.core_radius_mm > 0.0 && d < spec.core_radius_mm {
        50
    } else if d < spec.body_radius_mm {
        600
    } else {
        10
    }
}

/// Writes one encoded slice file.
fn write_slice_file(
    path: &Path,
    spec: &SeriesSpec,
    instance: usize,
    position_z: f64,
) -> std::io::Result<()> {
    let mut obj = InMemDicomObject::new_empty();
    let sop_uid = format!("{}.{}", spec.series_uid, instance + 1);
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(sop_uid),
    ));
    obj.put(DataElement::new(
        tags::MODALITY,
        VR::CS,
        PrimitiveValue::from("MR"),
    ));
    obj.put(DataElement::new(
        tags::SERIES_INSTANCE_UID,
        VR::UI,
        PrimitiveValue::from(spec.series_uid.clone()),
    ));
    obj.put(DataElement::new(
        tags::SERIES_DESCRIPTION,
        VR::LO,
        PrimitiveValue::from(spec.series_description.clone()),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_TYPE,
        VR::CS,
        PrimitiveValue::from(spec.image_type.clone()),
    ));
    obj.put(DataElement::new(
        tags::INSTANCE_NUMBER,
        VR::IS,
        PrimitiveValue::from(format!("{}", instance + 1)),
    ));
    obj.put(DataElement::new(
        tags::ROWS,
        VR::US,
        PrimitiveValue::from(spec.rows as u16),
    ));
    obj.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        PrimitiveValue::from(spec.columns as u16),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_SPACING,
        VR::DS,
        PrimitiveValue::from(decimal(&spec.pixel_spacing)),
    ));
    obj.put(DataElement::new(
        tags::SLICE_THICKNESS,
        VR::DS,
        PrimitiveValue::from(decimal(&[spec.slice_thickness])),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_POSITION_PATIENT,
        VR::DS,
        PrimitiveValue::from(decimal(&[0.0, 0.0, position_z])),
    ));
    obj.put(DataElement::new(
        tags::IMAGE_ORIENTATION_PATIENT,
        VR::DS,
        PrimitiveValue::from(decimal(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0])),
    ));
    obj.put(DataElement::new(
        tags::SAMPLES_PER_PIXEL,
        VR::US,
        PrimitiveValue::from(1u16),
    ));
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        PrimitiveValue::from("MONOCHROME2"),
    ));
    obj.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        PrimitiveValue::from(16u16),
    ));
    obj.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        PrimitiveValue::from(16u16),
    ));
    obj.put(DataElement::new(
        tags::HIGH_BIT,
        VR::US,
        PrimitiveValue::from(15u16),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_REPRESENTATION,
        VR::US,
        PrimitiveValue::from(0u16),
    ));

    let cy = (spec.rows as f64 - 1.0) / 2.0;
    let cx = (spec.columns as f64 - 1.0) / 2.0;
    let mut bytes = Vec::with_capacity(spec.rows * spec.columns * 2);
    for y in 0..spec.rows {
        for x in 0..spec.columns {
            let dx = (x as f64 - cx) * spec.pixel_spacing[1];
            let dy = (y as f64 - cy) * spec.pixel_spacing[0];
            let value = phantom_value(spec, dx, dy);
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        PrimitiveValue::from(bytes),
    ));

    let file_obj = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(dicom_transfer_syntax_registry::default().erased().uid())
                .media_storage_sop_class_uid(MR_IMAGE_STORAGE),
        )
        .unwrap();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    file_obj.write_to_file(path).unwrap();
    Ok(())
}

/// Writes a whole series under `root/<series_uid>/` and returns the blob keys.
pub fn write_series(root: &Path, spec: &SeriesSpec) -> Vec<String> {
    let mut keys = Vec::new();
    for i in 0..spec.slice_count {
        let key = format!("{}/{:04}.dcm", spec.series_uid, i + 1);
        let z = i as f64 * spec.slice_thickness;
        write_slice_file(&root.join(&key), spec, i, z).unwrap();
        keys.push(key);
    }
    keys
}
