use dicom::core::VR;
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom::pixeldata::PixelDecoder;
use snafu::ResultExt;

use crate::errors::{dicom::PixelDataSnafu, DicomError};
use crate::metadata::SliceHeader;

/// Numeric type of a stored pixel sample, from BitsAllocated and PixelRepresentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl SampleType {
    pub fn new(bits_allocated: u16, pixel_representation: u16) -> Result<Self, DicomError> {
        match (bits_allocated, pixel_representation) {
            (8, 0) => Ok(Self::U8),
            (8, 1) => Ok(Self::I8),
            (16, 0) => Ok(Self::U16),
            (16, 1) => Ok(Self::I16),
            (32, 0) => Ok(Self::U32),
            (32, 1) => Ok(Self::I32),
            _ => Err(DicomError::UnsupportedSampleType {
                bits_allocated,
                pixel_representation,
            }),
        }
    }

    pub fn bytes(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 => 4,
        }
    }

    pub fn bounds(&self) -> (f64, f64) {
        match self {
            Self::U8 => (u8::MIN as f64, u8::MAX as f64),
            Self::I8 => (i8::MIN as f64, i8::MAX as f64),
            Self::U16 => (u16::MIN as f64, u16::MAX as f64),
            Self::I16 => (i16::MIN as f64, i16::MAX as f64),
            Self::U32 => (u32::MIN as f64, u32::MAX as f64),
            Self::I32 => (i32::MIN as f64, i32::MAX as f64),
        }
    }

    /// Value representation of a native PixelData element holding this type.
    pub fn value_representation(&self) -> VR {
        match self.bytes() {
            1 => VR::OB,
            _ => VR::OW,
        }
    }

    /// Round to nearest and saturate at the type's bounds.
    pub fn quantize(&self, value: f64) -> f64 {
        let (lo, hi) = self.bounds();
        if value.is_nan() {
            return 0.0_f64.clamp(lo, hi);
        }
        num::clamp(value.round(), lo, hi)
    }

    /// Interpret little-endian bytes as samples of this type.
    pub fn decode(&self, bytes: &[u8]) -> Vec<f64> {
        let chunks = bytes.chunks_exact(self.bytes());
        match self {
            Self::U8 => bytes.iter().map(|&b| b as f64).collect(),
            Self::I8 => bytes.iter().map(|&b| b as i8 as f64).collect(),
            Self::U16 => chunks
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as f64)
                .collect(),
            Self::I16 => chunks
                .map(|c| i16::from_le_bytes([c[0], c[1]]) as f64)
                .collect(),
            Self::U32 => chunks
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            Self::I32 => chunks
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
        }
    }

    /// Quantize the values and encode them as little-endian bytes of this type.
    pub fn encode<I: IntoIterator<Item = f64>>(&self, values: I) -> Vec<u8> {
        let values = values.into_iter().map(|v| self.quantize(v));
        match self {
            Self::U8 => values.map(|v| v as u8).collect(),
            Self::I8 => values.map(|v| v as i8 as u8).collect(),
            Self::U16 => values.flat_map(|v| (v as u16).to_le_bytes()).collect(),
            Self::I16 => values.flat_map(|v| (v as i16).to_le_bytes()).collect(),
            Self::U32 => values.flat_map(|v| (v as u32).to_le_bytes()).collect(),
            Self::I32 => values.flat_map(|v| (v as i32).to_le_bytes()).collect(),
        }
    }
}

/// Decode the first frame of a slice into stored sample values, row-major.
pub fn decode_stored_values(
    file: &FileDicomObject<InMemDicomObject>,
    header: &SliceHeader,
) -> Result<Vec<f64>, DicomError> {
    if header.samples_per_pixel != 1 {
        return Err(DicomError::InvalidValueError {
            name: "Samples per Pixel",
            value: header.samples_per_pixel.to_string(),
        });
    }
    let sample_type = header.sample_type()?;
    let decoded = file.decode_pixel_data().context(PixelDataSnafu)?;
    let bytes = decoded.data();
    let expected = header.frame_len() * sample_type.bytes();
    if bytes.len() < expected {
        return Err(DicomError::PayloadLengthError {
            actual: bytes.len(),
            expected,
            rows: header.rows,
            columns: header.columns,
        });
    }
    Ok(sample_type.decode(&bytes[..expected]))
}
