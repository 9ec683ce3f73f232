use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject};
use snafu::ResultExt;

use crate::errors::{dicom::ConvertValueSnafu, DicomError};
use crate::metadata::SampleType;

/// Ordering key used when a slice has neither an instance number nor a position.
pub const FALLBACK_ORDERING_KEY: f64 = 0.0;

/// Modality LUT parameters mapping stored values to output units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            slope: 1.0,
            intercept: 0.0,
        }
    }
}

impl Rescale {
    pub fn is_identity(&self) -> bool {
        self.slope == 1.0 && self.intercept == 0.0
    }

    /// Stored value to output units.
    pub fn apply(&self, stored: f64) -> f64 {
        stored * self.slope + self.intercept
    }

    /// Output units back to a (non-quantized) stored value.
    pub fn invert(&self, value: f64) -> f64 {
        (value - self.intercept) / self.slope
    }
}

/// Header fields of a single slice needed for grouping, ordering, export and reinjection.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceHeader {
    pub series_instance_uid: String,
    pub instance_number: Option<i32>,
    pub image_position: Option<[f64; 3]>,
    /// Row direction cosines followed by column direction cosines.
    pub image_orientation: Option<[f64; 6]>,
    /// Spacing between rows, then between columns.
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    pub rows: usize,
    pub columns: usize,
    pub samples_per_pixel: u16,
    pub bits_allocated: u16,
    pub pixel_representation: u16,
    pub rescale: Rescale,
}

impl SliceHeader {
    /// Instance number when present, else the position along the acquisition axis.
    pub fn ordering_key(&self) -> f64 {
        match (self.instance_number, self.image_position) {
            (Some(number), _) => number as f64,
            (None, Some([_, _, z])) => z,
            (None, None) => FALLBACK_ORDERING_KEY,
        }
    }

    pub fn sample_type(&self) -> Result<SampleType, DicomError> {
        SampleType::new(self.bits_allocated, self.pixel_representation)
    }

    /// Number of stored samples in one frame.
    pub fn frame_len(&self) -> usize {
        self.rows * self.columns * self.samples_per_pixel as usize
    }
}

fn required_int(
    dcm: &InMemDicomObject,
    tag: Tag,
    name: &'static str,
) -> Result<i32, DicomError> {
    dcm.get(tag)
        .ok_or(DicomError::MissingPropertyError { name })?
        .value()
        .to_int::<i32>()
        .context(ConvertValueSnafu { name })
}

fn optional_int(dcm: &InMemDicomObject, tag: Tag) -> Option<i32> {
    let elem = dcm.get(tag)?;
    elem.value().to_int::<i32>().ok().or_else(|| {
        optional_str(dcm, tag)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.fract() == 0.0)
            .map(|v| v as i32)
    })
}

fn optional_str(dcm: &InMemDicomObject, tag: Tag) -> Option<String> {
    let value = dcm.get(tag)?.value().to_str().ok()?;
    let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    (!value.is_empty()).then(|| value.to_string())
}

/// Parse a backslash-delimited decimal string into exactly `N` values.
fn optional_floats<const N: usize>(dcm: &InMemDicomObject, tag: Tag) -> Option<[f64; N]> {
    let value = optional_str(dcm, tag)?;
    let parsed = value
        .split('\\')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    parsed.try_into().ok()
}

impl TryFrom<&InMemDicomObject> for SliceHeader {
    type Error = DicomError;

    fn try_from(dcm: &InMemDicomObject) -> Result<Self, Self::Error> {
        let series_instance_uid =
            optional_str(dcm, tags::SERIES_INSTANCE_UID).ok_or(DicomError::MissingPropertyError {
                name: "Series Instance UID",
            })?;
        let rows = required_int(dcm, tags::ROWS, "Rows")?;
        let columns = required_int(dcm, tags::COLUMNS, "Columns")?;
        let bits_allocated = required_int(dcm, tags::BITS_ALLOCATED, "Bits Allocated")?;
        let pixel_representation = optional_int(dcm, tags::PIXEL_REPRESENTATION).unwrap_or(0);
        let samples_per_pixel = optional_int(dcm, tags::SAMPLES_PER_PIXEL).unwrap_or(1);

        let rescale = Rescale {
            slope: optional_floats::<1>(dcm, tags::RESCALE_SLOPE)
                .map(|[v]| v)
                .filter(|v| *v != 0.0)
                .unwrap_or(1.0),
            intercept: optional_floats::<1>(dcm, tags::RESCALE_INTERCEPT)
                .map(|[v]| v)
                .unwrap_or(0.0),
        };

        Ok(Self {
            series_instance_uid,
            instance_number: optional_int(dcm, tags::INSTANCE_NUMBER),
            image_position: optional_floats(dcm, tags::IMAGE_POSITION_PATIENT),
            image_orientation: optional_floats(dcm, tags::IMAGE_ORIENTATION_PATIENT),
            pixel_spacing: optional_floats(dcm, tags::PIXEL_SPACING),
            slice_thickness: optional_floats::<1>(dcm, tags::SLICE_THICKNESS).map(|[v]| v),
            rows: rows.max(0) as usize,
            columns: columns.max(0) as usize,
            samples_per_pixel: samples_per_pixel.max(0) as u16,
            bits_allocated: bits_allocated.max(0) as u16,
            pixel_representation: pixel_representation.max(0) as u16,
            rescale,
        })
    }
}

impl TryFrom<&FileDicomObject<InMemDicomObject>> for SliceHeader {
    type Error = DicomError;

    fn try_from(file: &FileDicomObject<InMemDicomObject>) -> Result<Self, Self::Error> {
        Self::try_from(&**file)
    }
}
