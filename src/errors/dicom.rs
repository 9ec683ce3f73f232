use dicom::core::value::{CastValueError, ConvertValueError};
use dicom::object::{ReadError, WriteError};
pub use snafu::{Snafu, Whatever};
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DicomError {
    #[snafu(display("error reading DICOM file: {:?}", source))]
    ReadError {
        #[snafu(source(from(ReadError, Box::new)))]
        source: Box<ReadError>,
    },

    #[snafu(display("error writing DICOM file {}: {:?}", path.display(), source))]
    WriteError {
        path: PathBuf,
        #[snafu(source(from(WriteError, Box::new)))]
        source: Box<WriteError>,
    },

    #[snafu(display("missing DICOM property: {}", name))]
    MissingPropertyError { name: &'static str },

    #[snafu(display("unable to cast DICOM property value '{}': {:?}", name, source))]
    CastValueError {
        name: &'static str,
        #[snafu(source(from(CastValueError, Box::new)))]
        source: Box<CastValueError>,
    },

    #[snafu(display("unable to convert DICOM property value '{}': {:?}", name, source))]
    ConvertValueError {
        name: &'static str,
        #[snafu(source(from(ConvertValueError, Box::new)))]
        source: Box<ConvertValueError>,
    },

    #[snafu(display("invalid DICOM property value '{}': {}", name, value))]
    InvalidValueError { name: &'static str, value: String },

    #[snafu(display("error processing DICOM pixel data: {:?}", source))]
    PixelDataError {
        #[snafu(source(from(dicom::pixeldata::Error, Box::new)))]
        source: Box<dicom::pixeldata::Error>,
    },

    #[snafu(display(
        "unsupported sample layout: BitsAllocated={}, PixelRepresentation={}",
        bits_allocated,
        pixel_representation
    ))]
    UnsupportedSampleType {
        bits_allocated: u16,
        pixel_representation: u16,
    },

    #[snafu(display(
        "pixel payload holds {} bytes, expected {} for {}x{} samples",
        actual,
        expected,
        rows,
        columns
    ))]
    PayloadLengthError {
        actual: usize,
        expected: usize,
        rows: usize,
        columns: usize,
    },

    #[snafu(display("error building file meta group: {}", message))]
    MetaError { message: String },

    #[snafu(display("{}", message))]
    Other { message: String },
}

impl From<Whatever> for DicomError {
    fn from(source: Whatever) -> Self {
        Self::Other {
            message: source.to_string(),
        }
    }
}
