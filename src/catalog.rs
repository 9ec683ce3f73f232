use rayon::prelude::*;
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::errors::{dicom::ReadSnafu, DicomError};
use crate::file::DicomFileOperations;
use crate::metadata::SliceHeader;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    #[snafu(display("Failed to list directory {}: {}", path.display(), source))]
    ListDirectory {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display(
        "No series found in {}: none of {} candidate files had a readable header",
        path.display(),
        candidates
    ))]
    NoSeriesFound { path: PathBuf, candidates: usize },
}

/// A slice file and its parsed header. The payload is never loaded here.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceRecord {
    pub path: PathBuf,
    pub header: SliceHeader,
}

impl SliceRecord {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, DicomError> {
        let path = path.as_ref();
        let file = path.dcmread_header().context(ReadSnafu)?;
        let header = SliceHeader::try_from(&file)?;
        Ok(Self {
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn ordering_key(&self) -> f64 {
        self.header.ordering_key()
    }
}

/// Slices sharing a series identifier, in reconstruction order.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub uid: String,
    pub slices: Vec<SliceRecord>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn first(&self) -> Option<&SliceRecord> {
        self.slices.first()
    }

    pub fn last(&self) -> Option<&SliceRecord> {
        self.slices.last()
    }
}

/// Every series found directly inside one directory.
///
/// Series are kept in the order their first file was discovered, which is path order.
/// Callers must not attach meaning to that order beyond it being stable within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesCatalog {
    dir: PathBuf,
    series: Vec<Series>,
}

impl SeriesCatalog {
    /// Read the headers of every slice file in `dir` and group them by series.
    /// Files whose header cannot be parsed are skipped.
    pub fn discover<P: AsRef<Path>>(dir: P) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let paths = dir.find_dicoms().context(ListDirectorySnafu { path: dir })?;
        let candidates = paths.len();

        let records = paths
            .par_iter()
            .filter_map(|path| match SliceRecord::read(path) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    None
                }
            })
            .collect::<Vec<_>>();

        let catalog = Self::from_records(dir, records);
        if catalog.is_empty() {
            return NoSeriesFoundSnafu {
                path: dir,
                candidates,
            }
            .fail();
        }
        info!(
            "Found {} series in {} ({} of {} files readable)",
            catalog.len(),
            dir.display(),
            catalog.iter().map(Series::len).sum::<usize>(),
            candidates
        );
        Ok(catalog)
    }

    /// Group records by series identifier and order each series by its ordering key.
    /// The sort is stable, so ties keep discovery order.
    pub fn from_records<P: AsRef<Path>>(dir: P, records: Vec<SliceRecord>) -> Self {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut series: Vec<Series> = Vec::new();
        for record in records {
            let uid = record.header.series_instance_uid.clone();
            let i = *index.entry(uid.clone()).or_insert_with(|| {
                series.push(Series {
                    uid,
                    slices: Vec::new(),
                });
                series.len() - 1
            });
            series[i].slices.push(record);
        }
        for s in series.iter_mut() {
            s.slices
                .sort_by(|a, b| a.ordering_key().total_cmp(&b.ordering_key()));
        }
        Self {
            dir: dir.as_ref().to_path_buf(),
            series,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, uid: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.uid == uid)
    }

    pub fn first(&self) -> Option<&Series> {
        self.series.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Series> {
        self.series.iter()
    }

    pub fn uids(&self) -> Vec<&str> {
        self.series.iter().map(|s| s.uid.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Rescale;
    use crate::testing::{series_uid, write_series};

    fn record(name: &str, uid: &str, instance: Option<i32>, z: Option<f64>) -> SliceRecord {
        SliceRecord {
            path: PathBuf::from(name),
            header: SliceHeader {
                series_instance_uid: uid.to_string(),
                instance_number: instance,
                image_position: z.map(|z| [0.0, 0.0, z]),
                image_orientation: None,
                pixel_spacing: None,
                slice_thickness: None,
                rows: 2,
                columns: 2,
                samples_per_pixel: 1,
                bits_allocated: 16,
                pixel_representation: 1,
                rescale: Rescale::default(),
            },
        }
    }

    fn names(series: &Series) -> Vec<&str> {
        series
            .slices
            .iter()
            .map(|s| s.path.to_str().unwrap())
            .collect()
    }

    #[test]
    fn test_from_records_groups_and_orders() {
        let records = vec![
            record("a", "1", Some(3), None),
            record("b", "2", None, Some(-10.0)),
            record("c", "1", Some(1), None),
            record("d", "2", None, Some(-20.0)),
            record("e", "1", Some(2), None),
        ];
        let catalog = SeriesCatalog::from_records("/data", records);
        assert_eq!(catalog.uids(), vec!["1", "2"]);
        assert_eq!(names(catalog.get("1").unwrap()), vec!["c", "e", "a"]);
        assert_eq!(names(catalog.get("2").unwrap()), vec!["d", "b"]);
    }

    #[test]
    fn test_from_records_stable_without_keys() {
        let records = vec![
            record("z", "1", None, None),
            record("y", "1", None, None),
            record("x", "1", None, None),
        ];
        let catalog = SeriesCatalog::from_records("/data", records);
        assert_eq!(names(catalog.first().unwrap()), vec!["z", "y", "x"]);
    }

    #[test]
    fn test_discover() {
        let temp_dir = tempfile::tempdir().unwrap();
        let expected_a = write_series(temp_dir.path(), &series_uid(1), 5, 4, 3);
        let expected_b = write_series(temp_dir.path(), &series_uid(2), 3, 4, 3);
        std::fs::write(temp_dir.path().join("broken.dcm"), b"not a DICOM file").unwrap();
        std::fs::write(temp_dir.path().join("readme.txt"), b"ignored").unwrap();

        let catalog = SeriesCatalog::discover(temp_dir.path()).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.dir(), temp_dir.path());

        let a = catalog.get(&series_uid(1)).unwrap();
        let paths: Vec<_> = a.slices.iter().map(|s| s.path.clone()).collect();
        assert_eq!(paths, expected_a);
        assert_eq!(a.first().unwrap().header.instance_number, Some(1));
        assert_eq!(a.last().unwrap().header.instance_number, Some(5));

        let b = catalog.get(&series_uid(2)).unwrap();
        assert_eq!(b.len(), expected_b.len());
    }

    #[test]
    fn test_discover_no_series() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("broken.dcm"), b"not a DICOM file").unwrap();
        let result = SeriesCatalog::discover(temp_dir.path());
        assert!(matches!(
            result,
            Err(CatalogError::NoSeriesFound { candidates: 1, .. })
        ));
    }
}
