//! Synthetic CT series for tests.
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::{open_file, FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom::transfer_syntax::entries::EXPLICIT_VR_LITTLE_ENDIAN;
use ndarray::Axis;
use std::path::{Path, PathBuf};

use crate::metadata::CT_IMAGE_STORAGE;
use crate::reconcile::rot90;
use crate::volume::{SliceAxis, Volume};

pub const RESCALE_INTERCEPT: f64 = -1024.0;
pub const PATIENT_NAME: &str = "Doe^Jane";

/// Stored values of slice `index`. Asymmetric so that no rotation maps a plane onto itself.
pub fn stored_values(index: usize, rows: usize, columns: usize) -> Vec<i16> {
    (0..rows * columns)
        .map(|i| {
            let (r, c) = (i / columns, i % columns);
            (index * 97 + r * r * 13 + c * 7 + r * c) as i16 % 3000
        })
        .collect()
}

pub fn series_uid(n: usize) -> String {
    format!("1.2.826.0.1.3680043.2.1125.{n}")
}

/// Write one CT slice with a 16-bit signed payload.
pub fn write_slice(
    path: &Path,
    series_instance_uid: &str,
    instance_number: usize,
    rows: usize,
    columns: usize,
    values: &[i16],
) {
    let sop_instance_uid = format!("{series_instance_uid}.{instance_number}");
    let z = instance_number as f64 * 2.5;
    let pixel_bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(CT_IMAGE_STORAGE)),
        DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid.as_str()),
        ),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from(PATIENT_NAME)),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P0001")),
        DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(series_instance_uid),
        ),
        DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            PrimitiveValue::from(instance_number.to_string()),
        ),
        DataElement::new(
            tags::IMAGE_POSITION_PATIENT,
            VR::DS,
            PrimitiveValue::from(format!("-120\\-80\\{z}")),
        ),
        DataElement::new(
            tags::IMAGE_ORIENTATION_PATIENT,
            VR::DS,
            PrimitiveValue::from("1\\0\\0\\0\\1\\0"),
        ),
        DataElement::new(tags::PIXEL_SPACING, VR::DS, PrimitiveValue::from("0.5\\0.5")),
        DataElement::new(tags::SLICE_THICKNESS, VR::DS, PrimitiveValue::from("2.5")),
        DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            PrimitiveValue::from("MONOCHROME2"),
        ),
        DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(rows as u16)),
        DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(columns as u16)),
        DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::BITS_STORED, VR::US, PrimitiveValue::from(16_u16)),
        DataElement::new(tags::HIGH_BIT, VR::US, PrimitiveValue::from(15_u16)),
        DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(1_u16)),
        DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, PrimitiveValue::from("-1024")),
        DataElement::new(tags::RESCALE_SLOPE, VR::DS, PrimitiveValue::from("1")),
        DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::from(pixel_bytes)),
    ]);

    let meta = FileMetaTableBuilder::new()
        .transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN.uid())
        .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_instance_uid.as_str())
        .build()
        .unwrap();
    let mut file = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for elem in obj {
        file.put(elem);
    }
    file.write_to_file(path).unwrap();
}

/// Write a series of `count` slices into `dir`, named so that file name order is the
/// reverse of instance number order. Returns the paths in instance number order.
pub fn write_series(
    dir: &Path,
    series_instance_uid: &str,
    count: usize,
    rows: usize,
    columns: usize,
) -> Vec<PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    (1..=count)
        .map(|instance| {
            let name = format!("{}_{:04}.dcm", series_prefix(series_instance_uid), count - instance);
            let path = dir.join(name);
            let values = stored_values(instance, rows, columns);
            write_slice(&path, series_instance_uid, instance, rows, columns, &values);
            path
        })
        .collect()
}

fn series_prefix(series_instance_uid: &str) -> &str {
    series_instance_uid
        .rsplit('.')
        .next()
        .unwrap_or(series_instance_uid)
}

/// Raw PixelData bytes of a file.
pub fn pixel_bytes(path: &Path) -> Vec<u8> {
    let file = open_file(path).unwrap();
    file.element(tags::PIXEL_DATA)
        .unwrap()
        .to_bytes()
        .unwrap()
        .into_owned()
}

/// A string-valued element of a file.
pub fn element_str(path: &Path, tag: dicom::core::Tag) -> String {
    let file = open_file(path).unwrap();
    file.element(tag)
        .unwrap()
        .to_str()
        .unwrap()
        .trim_end_matches(['\0', ' '])
        .to_string()
}

/// Turn every plane of a (column, row, slice) volume by `k` quarter turns. Planes must be square.
pub fn turn_slices(volume: &mut Volume, k: u8) {
    for index in 0..volume.slice_count(SliceAxis::Last) {
        let turned = rot90(volume.plane(SliceAxis::Last, index), k).to_owned();
        volume
            .data
            .index_axis_mut(Axis(2), index)
            .reversed_axes()
            .assign(&turned);
    }
}
