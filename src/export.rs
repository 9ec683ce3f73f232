use ndarray::Array3;
use rayon::prelude::*;
use snafu::{OptionExt, ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::catalog::{Series, SeriesCatalog, SliceRecord};
use crate::errors::{dicom::ReadSnafu, DicomError, NiftiError};
use crate::file::DicomFileOperations;
use crate::metadata::{decode_stored_values, series_affine, IDENTITY_AFFINE};
use crate::volume::{Volume, VoxelType};

/// Marks a volume as the single modality channel of a case.
pub const CHANNEL_SUFFIX: &str = "_0000";

/// Extension of exported volumes.
pub const VOLUME_EXTENSION: &str = ".nii.gz";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExportError {
    #[snafu(display("Series {} not found, available series: {:?}", uid, available))]
    SeriesNotFound { uid: String, available: Vec<String> },

    #[snafu(display("No series to export in {}", path.display()))]
    EmptyCatalog { path: PathBuf },

    #[snafu(display("Series {} has no slices", uid))]
    EmptySeries { uid: String },

    #[snafu(display("Failed to read slice {}: {}", path.display(), source))]
    ReadSlice {
        path: PathBuf,
        #[snafu(source(from(DicomError, Box::new)))]
        source: Box<DicomError>,
    },

    #[snafu(display(
        "Slice {} is {}x{}, but the series starts with {}x{} slices",
        path.display(),
        actual.0,
        actual.1,
        expected.0,
        expected.1
    ))]
    InconsistentDimensions {
        path: PathBuf,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[snafu(display("Failed to assemble volume for series {}: {}", uid, source))]
    Assemble {
        uid: String,
        source: ndarray::ShapeError,
    },

    #[snafu(display("Failed to write volume: {}", source))]
    WriteVolume {
        #[snafu(source(from(NiftiError, Box::new)))]
        source: Box<NiftiError>,
    },
}

/// File name under which a series is handed to the external tool.
pub fn export_file_name(series_uid: &str, channel_suffix: bool) -> String {
    let suffix = if channel_suffix { CHANNEL_SUFFIX } else { "" };
    format!("{series_uid}{suffix}{VOLUME_EXTENSION}")
}

/// A series written to volume format.
#[derive(Debug, Clone)]
pub struct Export {
    pub series_uid: String,
    pub path: PathBuf,
    pub volume: Volume,
}

#[derive(Debug, Clone)]
pub struct Exporter {
    /// Append the channel suffix to the exported file name.
    pub channel_suffix: bool,
}

impl Default for Exporter {
    fn default() -> Self {
        Self {
            channel_suffix: true,
        }
    }
}

/// Decode one slice into rescaled values, checking it against the series grid.
fn read_plane(record: &SliceRecord, grid: (usize, usize)) -> Result<Vec<f32>, ExportError> {
    let header = &record.header;
    let actual = (header.rows, header.columns);
    if actual != grid {
        return InconsistentDimensionsSnafu {
            path: &record.path,
            expected: grid,
            actual,
        }
        .fail();
    }
    let file = record
        .path
        .dcmread()
        .context(ReadSnafu)
        .context(ReadSliceSnafu { path: &record.path })?;
    let stored =
        decode_stored_values(&file, header).context(ReadSliceSnafu { path: &record.path })?;
    let rescale = header.rescale;
    if rescale.is_identity() {
        return Ok(stored.into_iter().map(|v| v as f32).collect());
    }
    Ok(stored
        .into_iter()
        .map(|v| rescale.apply(v) as f32)
        .collect())
}

impl Exporter {
    /// Pick the series to export. Without a preselection the first series is used,
    /// with a warning when there is more than one.
    pub fn select_series<'a>(
        &self,
        catalog: &'a SeriesCatalog,
        preselected: Option<&str>,
    ) -> Result<&'a Series, ExportError> {
        match preselected {
            Some(uid) => catalog.get(uid).context(SeriesNotFoundSnafu {
                uid,
                available: catalog
                    .uids()
                    .into_iter()
                    .map(String::from)
                    .collect::<Vec<_>>(),
            }),
            None => {
                let series = catalog
                    .first()
                    .context(EmptyCatalogSnafu { path: catalog.dir() })?;
                if catalog.len() > 1 {
                    warn!(
                        "Found {} series in {}, using the first one: {}",
                        catalog.len(),
                        catalog.dir().display(),
                        series.uid
                    );
                }
                Ok(series)
            }
        }
    }

    /// Stack the series' payloads in catalog order as (column, row, slice), the voxel
    /// order volume readers expect with the slice axis last.
    pub fn assemble(&self, series: &Series) -> Result<Volume, ExportError> {
        let (first, last) = match (series.first(), series.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return EmptySeriesSnafu { uid: &series.uid }.fail(),
        };
        let grid = (first.header.rows, first.header.columns);

        let planes = series
            .slices
            .par_iter()
            .map(|record| read_plane(record, grid))
            .collect::<Result<Vec<_>, _>>()?;
        let stacked = Array3::from_shape_vec(
            (series.len(), grid.0, grid.1),
            planes.into_iter().flatten().collect(),
        )
        .context(AssembleSnafu { uid: &series.uid })?;
        let data = stacked
            .permuted_axes([2, 1, 0])
            .as_standard_layout()
            .into_owned();

        let affine = series_affine(&first.header, &last.header, series.len()).unwrap_or_else(|| {
            warn!(
                "Series {} lacks position, orientation or spacing, writing an identity affine",
                series.uid
            );
            IDENTITY_AFFINE
        });
        Ok(Volume::new(data, affine))
    }

    /// Export the selected series of `catalog` into `output_dir`.
    pub fn export<P: AsRef<Path>>(
        &self,
        catalog: &SeriesCatalog,
        preselected: Option<&str>,
        output_dir: P,
    ) -> Result<Export, ExportError> {
        let series = self.select_series(catalog, preselected)?;
        let mut volume = self.assemble(series)?;
        let path = output_dir
            .as_ref()
            .join(export_file_name(&series.uid, self.channel_suffix));
        let voxel_type = VoxelType::infer(&volume.data);
        volume.save(&path, voxel_type).context(WriteVolumeSnafu)?;
        volume.path = Some(path.clone());
        info!(
            "Exported series {} ({} slices) to {}",
            series.uid,
            series.len(),
            path.display()
        );
        Ok(Export {
            series_uid: series.uid.clone(),
            path,
            volume,
        })
    }
}
