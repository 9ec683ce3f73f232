use nifti::error::NiftiError as NiftiLibError;
pub use snafu::{Snafu, Whatever};
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum NiftiError {
    #[snafu(display("error reading volume {}: {:?}", path.display(), source))]
    ReadError {
        path: PathBuf,
        #[snafu(source(from(NiftiLibError, Box::new)))]
        source: Box<NiftiLibError>,
    },

    #[snafu(display("error writing volume {}: {:?}", path.display(), source))]
    WriteError {
        path: PathBuf,
        #[snafu(source(from(NiftiLibError, Box::new)))]
        source: Box<NiftiLibError>,
    },

    #[snafu(display(
        "volume {} has {} dimensions with shape {:?}, expected 3",
        path.display(),
        ndim,
        shape
    ))]
    UnsupportedDimensionality {
        path: PathBuf,
        ndim: usize,
        shape: Vec<usize>,
    },

    #[snafu(display("error creating directory {}: {:?}", path.display(), source))]
    CreateDirError {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("{}", message))]
    Other { message: String },
}

impl From<Whatever> for NiftiError {
    fn from(source: Whatever) -> Self {
        Self::Other {
            message: source.to_string(),
        }
    }
}
