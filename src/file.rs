use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject, OpenFileOptions, ReadError};
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const DICM_PREFIX: &[u8; 4] = b"DICM";
pub const DICM_PREFIX_LOCATION: u64 = 128;

/// Extensions recognized as volume files, longest first so `.nii.gz` wins over `.gz`.
pub const NIFTI_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

type IOResult<T> = Result<T, std::io::Error>;

pub fn default_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{msg} {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta} @ {per_sec})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb
}

/// List the direct children of a directory, sorted by path.
fn sorted_children(dir: &Path) -> IOResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Not a directory: {}", dir.display()),
        ));
    }
    let entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<IOResult<Vec<_>>>()?;
    Ok(entries.into_iter().sorted().collect())
}

pub trait DirectoryOperations
where
    Self: AsRef<Path>,
{
    /// Immediate subdirectories, sorted by path.
    fn subdirectories(&self) -> IOResult<Vec<PathBuf>> {
        Ok(sorted_children(self.as_ref())?
            .into_iter()
            .filter(|p| p.is_dir())
            .collect())
    }

    /// Remove the directory if it exists and create it empty.
    fn recreate_dir(&self) -> IOResult<()> {
        let dir = self.as_ref();
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)
    }
}

impl<P: AsRef<Path>> DirectoryOperations for P {}

pub trait DicomFileOperations
where
    Self: AsRef<Path>,
{
    /// Check if a file has a DICM prefix.
    /// This will only return an error if the file cannot be opened.
    /// Any other errors mapped to `false`.
    fn has_dicm_prefix(&self) -> IOResult<bool> {
        let mut reader = File::open(self.as_ref())?;
        let mut buffer = [0; DICM_PREFIX.len()];
        reader
            .seek(SeekFrom::Start(DICM_PREFIX_LOCATION))
            .and_then(|_| reader.read_exact(&mut buffer))
            .map_or(Ok(false), |_| Ok(&buffer == DICM_PREFIX))
    }

    /// Check if a file has a DICOM extension, ignoring case.
    fn has_dicom_extension(&self) -> bool {
        match self.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) => ext.eq_ignore_ascii_case("dcm") || ext.eq_ignore_ascii_case("dicom"),
            None => false,
        }
    }

    /// Check if a path is a DICOM file as efficiently as possible.
    /// The extension is trusted when present, otherwise the DICM prefix is checked.
    fn is_dicom_file(&self) -> IOResult<bool> {
        let path = self.as_ref();
        if self.has_dicom_extension() {
            Ok(path.is_file())
        } else if path.is_dir() || path.has_nifti_extension() {
            Ok(false)
        } else {
            self.has_dicm_prefix()
        }
    }

    /// Similar to `is_dicom_file`, but returns a default value if an error occurs.
    fn is_dicom_file_or(&self, default: bool) -> bool {
        self.is_dicom_file().unwrap_or(default)
    }

    /// Find the DICOM files directly inside a directory, sorted by path.
    /// Subdirectories are not descended into.
    fn find_dicoms(&self) -> IOResult<Vec<PathBuf>> {
        Ok(sorted_children(self.as_ref())?
            .into_iter()
            .filter(|p| p.is_dicom_file_or(false))
            .collect())
    }

    /// Check whether a directory directly contains at least one DICOM file.
    fn has_dicoms(&self) -> bool {
        match sorted_children(self.as_ref()) {
            Ok(children) => children.iter().any(|p| p.is_dicom_file_or(false)),
            Err(_) => false,
        }
    }

    /// Read the DICOM file.
    fn dcmread(&self) -> Result<DefaultDicomObject, ReadError> {
        open_file(self.as_ref())
    }

    /// Read the DICOM file up to, but not including, the pixel data.
    fn dcmread_header(&self) -> Result<DefaultDicomObject, ReadError> {
        OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(self.as_ref())
    }
}

impl<P: AsRef<Path>> DicomFileOperations for P {}

pub trait NiftiFileOperations
where
    Self: AsRef<Path>,
{
    /// Check if a path ends in `.nii` or `.nii.gz`.
    fn has_nifti_extension(&self) -> bool {
        self.nifti_stem().is_some()
    }

    /// The file name with the volume extension removed, or `None` if there is no such extension.
    fn nifti_stem(&self) -> Option<String> {
        let name = self.as_ref().file_name()?.to_str()?;
        NIFTI_EXTENSIONS
            .iter()
            .find_map(|ext| name.strip_suffix(ext))
            .filter(|stem| !stem.is_empty())
            .map(str::to_string)
    }

    /// Find the volume files directly inside a directory, sorted by path.
    fn find_niftis(&self) -> IOResult<Vec<PathBuf>> {
        Ok(sorted_children(self.as_ref())?
            .into_iter()
            .filter(|p| p.is_file() && p.has_nifti_extension())
            .collect())
    }
}

impl<P: AsRef<Path>> NiftiFileOperations for P {}
