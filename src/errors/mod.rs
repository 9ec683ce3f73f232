pub mod dicom;
pub mod nifti;

pub use self::dicom::DicomError;
pub use self::nifti::NiftiError;
