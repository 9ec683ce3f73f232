//! Writing a modified volume back into the containers of its source series.
//!
//! Every output file is rebuilt from the original: all dataset elements are carried over by
//! value, the file meta group is restored field by field, and only the pixel payload of
//! slices covered by the volume is replaced. Slices past the end of the volume are copied
//! through with their payload untouched.
use dicom::core::{DataElement, PrimitiveValue};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::object::{FileDicomObject, InMemDicomObject};
use dicom::transfer_syntax::entries::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use ndarray::ArrayView2;
use rayon::prelude::*;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::catalog::{Series, SliceRecord};
use crate::errors::dicom::{ReadSnafu, WriteSnafu};
use crate::errors::DicomError;
use crate::file::DicomFileOperations;
use crate::metadata::{MetaFields, RestoreReport};
use crate::reconcile::{rot90, to_stored_plane, Reconciliation};
use crate::volume::{SliceAxis, Volume};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReinjectError {
    #[snafu(display("Refusing to write slices into their source directory {}", path.display()))]
    InPlace { path: PathBuf },

    #[snafu(display("Failed to create output directory {}: {}", path.display(), source))]
    CreateOutput {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("Failed to read slice {}: {}", path.display(), source))]
    ReadSlice {
        path: PathBuf,
        #[snafu(source(from(DicomError, Box::new)))]
        source: Box<DicomError>,
    },

    #[snafu(display(
        "Plane {} is {}x{} after rotation, but slice {} is {}x{}",
        index,
        actual.0,
        actual.1,
        path.display(),
        expected.0,
        expected.1
    ))]
    ShapeMismatch {
        path: PathBuf,
        index: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[snafu(display("Failed to rebuild slice {}: {}", path.display(), source))]
    Rebuild {
        path: PathBuf,
        #[snafu(source(from(DicomError, Box::new)))]
        source: Box<DicomError>,
    },
}

/// Outcome of writing one series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReinjectReport {
    pub written: usize,
    pub replaced: usize,
    pub copied: usize,
    pub restore: RestoreReport,
}

fn is_native_little_endian(uid: &str) -> bool {
    uid == IMPLICIT_VR_LITTLE_ENDIAN.uid() || uid == EXPLICIT_VR_LITTLE_ENDIAN.uid()
}

/// Transfer syntax to write a rebuilt slice with.
///
/// A missing or unrecognized syntax becomes implicit VR little endian. A replaced payload
/// is always native little endian, so anything else becomes explicit VR little endian.
pub fn output_transfer_syntax(original: Option<&str>, payload_replaced: bool) -> String {
    let known = original
        .map(|uid| uid.trim_end_matches('\0'))
        .filter(|uid| TransferSyntaxRegistry.get(uid).is_some());
    match known {
        None => IMPLICIT_VR_LITTLE_ENDIAN.uid().to_string(),
        Some(uid) if !payload_replaced || is_native_little_endian(uid) => uid.to_string(),
        Some(_) => EXPLICIT_VR_LITTLE_ENDIAN.uid().to_string(),
    }
}

/// Rebuild `record` under `output_dir`, optionally with a new payload.
fn write_slice(
    record: &SliceRecord,
    payload: Option<Vec<u8>>,
    output_dir: &Path,
) -> Result<(PathBuf, RestoreReport), ReinjectError> {
    let source = &record.path;
    let file = source
        .dcmread()
        .context(ReadSnafu)
        .context(ReadSliceSnafu { path: source })?;
    let fields = MetaFields::from(file.meta());
    let replaced = payload.is_some();
    let transfer_syntax = output_transfer_syntax(fields.transfer_syntax.as_deref(), replaced);
    let mut dataset: InMemDicomObject = file.into_inner();

    let vr = record
        .header
        .sample_type()
        .context(RebuildSnafu { path: source })?
        .value_representation();
    match payload {
        Some(bytes) => {
            dataset.put(DataElement::new(
                tags::PIXEL_DATA,
                vr,
                PrimitiveValue::from(bytes),
            ));
        }
        None => {
            // Encapsulated payloads keep their fragments and VR.
            let native = dataset
                .get(tags::PIXEL_DATA)
                .and_then(|e| e.value().primitive())
                .cloned();
            if let Some(value) = native {
                dataset.put(DataElement::new(tags::PIXEL_DATA, vr, value));
            }
        }
    }

    let (meta, report) = fields
        .restore(&dataset, &transfer_syntax)
        .context(RebuildSnafu { path: source })?;
    let mut rebuilt = FileDicomObject::new_empty_with_dict_and_meta(StandardDataDictionary, meta);
    for element in dataset {
        rebuilt.put(element);
    }

    let file_name = source.file_name().unwrap_or(source.as_os_str());
    let path = output_dir.join(file_name);
    rebuilt
        .write_to_file(&path)
        .context(WriteSnafu { path: &path })
        .context(RebuildSnafu { path: source })?;
    for failure in &report.failures {
        debug!("{}: {}", path.display(), failure);
    }
    Ok((path, report))
}

/// Rotated plane for slice `index`, checked against the slice's grid and sample type.
fn oriented_plane<'v>(
    record: &SliceRecord,
    volume: &'v Volume,
    axis: SliceAxis,
    rotation: u8,
    index: usize,
) -> Result<ArrayView2<'v, f32>, ReinjectError> {
    let header = &record.header;
    let plane = rot90(volume.plane(axis, index), rotation);
    let expected = (header.rows, header.columns);
    if plane.dim() != expected {
        return ShapeMismatchSnafu {
            path: &record.path,
            index,
            expected,
            actual: plane.dim(),
        }
        .fail();
    }
    header
        .sample_type()
        .context(RebuildSnafu { path: &record.path })?;
    Ok(plane)
}

/// Stored payload for slice `index` of the volume.
fn encode_plane(
    record: &SliceRecord,
    volume: &Volume,
    axis: SliceAxis,
    rotation: u8,
    index: usize,
) -> Result<Vec<u8>, ReinjectError> {
    let header = &record.header;
    let plane = oriented_plane(record, volume, axis, rotation, index)?;
    let stored = to_stored_plane(plane, header).context(RebuildSnafu { path: &record.path })?;
    let sample_type = header
        .sample_type()
        .context(RebuildSnafu { path: &record.path })?;
    Ok(sample_type.encode(stored.iter().copied()))
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Write every slice of `series` into `output_dir`, replacing the payload of the first
/// `min(volume extent, series length)` slices with planes of `volume`.
///
/// Every replaced plane is checked before anything is written, and slices past the end of
/// the volume are copied only once all replaced slices are on disk. A failed call never
/// leaves original pixel data for a covered slice in `output_dir`.
pub fn reinject<P: AsRef<Path>>(
    series: &Series,
    volume: &Volume,
    axis: SliceAxis,
    rotation: u8,
    output_dir: P,
) -> Result<ReinjectReport, ReinjectError> {
    let output_dir = output_dir.as_ref();
    let target = canonical(output_dir);
    for record in &series.slices {
        if let Some(parent) = record.path.parent() {
            if canonical(parent) == target {
                return InPlaceSnafu { path: output_dir }.fail();
            }
        }
    }

    let overlap = volume.slice_count(axis).min(series.len());
    let (covered, trailing) = series.slices.split_at(overlap);
    for (index, record) in covered.iter().enumerate() {
        oriented_plane(record, volume, axis, rotation, index)?;
    }
    std::fs::create_dir_all(output_dir).context(CreateOutputSnafu { path: output_dir })?;

    let replaced = covered
        .par_iter()
        .enumerate()
        .map(|(index, record)| {
            let payload = encode_plane(record, volume, axis, rotation, index)?;
            write_slice(record, Some(payload), output_dir).map(|(_, report)| report)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let copied = trailing
        .par_iter()
        .map(|record| write_slice(record, None, output_dir).map(|(_, report)| report))
        .collect::<Result<Vec<_>, _>>()?;

    let mut restore = RestoreReport::default();
    for report in replaced.into_iter().chain(copied) {
        restore.extend(report);
    }
    if !restore.is_clean() {
        warn!(
            "{} file meta fields could not be carried over verbatim for series {}",
            restore.failures.len(),
            series.uid
        );
    }
    let report = ReinjectReport {
        written: series.len(),
        replaced: overlap,
        copied: series.len() - overlap,
        restore,
    };
    info!(
        "Wrote {} slices to {} ({} replaced, {} copied)",
        report.written,
        output_dir.display(),
        report.replaced,
        report.copied
    );
    Ok(report)
}

/// Reinject `volume` as matched by the reconciler.
pub fn reinject_reconciled<P: AsRef<Path>>(
    reconciliation: &Reconciliation<'_>,
    volume: &Volume,
    output_dir: P,
) -> Result<ReinjectReport, ReinjectError> {
    reinject(
        reconciliation.series,
        volume,
        reconciliation.axis,
        reconciliation.rotation,
        output_dir,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SeriesCatalog;
    use crate::export::Exporter;
    use crate::metadata::{SampleType, IDENTITY_AFFINE};
    use crate::reconcile::{Reconciler, RotationMode};
    use crate::testing::{
        element_str, pixel_bytes, series_uid, turn_slices, write_series, PATIENT_NAME,
    };
    use dicom::object::open_file;
    use ndarray::Array3;
    use rstest::rstest;

    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    #[rstest]
    #[case::missing(None, true, IMPLICIT_VR_LITTLE_ENDIAN.uid())]
    #[case::unknown(Some("1.2.3.4.5"), false, IMPLICIT_VR_LITTLE_ENDIAN.uid())]
    #[case::implicit(Some(IMPLICIT_VR_LITTLE_ENDIAN.uid()), true, IMPLICIT_VR_LITTLE_ENDIAN.uid())]
    #[case::explicit(Some(EXPLICIT_VR_LITTLE_ENDIAN.uid()), true, EXPLICIT_VR_LITTLE_ENDIAN.uid())]
    #[case::compressed_replaced(Some(JPEG_BASELINE), true, EXPLICIT_VR_LITTLE_ENDIAN.uid())]
    #[case::compressed_copied(Some(JPEG_BASELINE), false, JPEG_BASELINE)]
    #[case::padded(Some("1.2.840.10008.1.2.1\0"), true, EXPLICIT_VR_LITTLE_ENDIAN.uid())]
    fn test_output_transfer_syntax(
        #[case] original: Option<&str>,
        #[case] replaced: bool,
        #[case] expected: &str,
    ) {
        assert_eq!(output_transfer_syntax(original, replaced), expected);
    }

    fn file_name(path: &Path) -> String {
        path.file_name().unwrap().to_string_lossy().into_owned()
    }

    fn sorted_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| file_name(&e.unwrap().path()))
            .collect();
        names.sort();
        names
    }

    /// Export a series and read the written volume back.
    fn round_trip_volume(dir: &Path, count: usize, rows: usize, columns: usize) -> (SeriesCatalog, Volume) {
        let input = dir.join("in");
        write_series(&input, &series_uid(1), count, rows, columns);
        let catalog = SeriesCatalog::discover(&input).unwrap();
        let export = Exporter::default()
            .export(&catalog, None, dir.join("volume_in"))
            .unwrap();
        let volume = Volume::open(&export.path).unwrap();
        (catalog, volume)
    }

    #[test]
    fn test_identity_round_trip_is_byte_exact() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (catalog, volume) = round_trip_volume(temp_dir.path(), 5, 6, 4);
        assert_eq!(volume.shape(), [4, 6, 5]);
        let reconciliation = Reconciler::new(RotationMode::Restricted)
            .reconcile(&volume, &catalog)
            .unwrap();
        assert_eq!(reconciliation.axis, SliceAxis::Last);
        assert_eq!(reconciliation.rotation, 0);

        let out = temp_dir.path().join("out");
        let report = reinject_reconciled(&reconciliation, &volume, &out).unwrap();
        assert_eq!(report.written, 5);
        assert_eq!(report.replaced, 5);
        assert_eq!(report.copied, 0);
        assert!(report.restore.is_clean(), "{:?}", report.restore);

        let series = catalog.first().unwrap();
        for record in &series.slices {
            let written = out.join(record.path.file_name().unwrap());
            assert_eq!(pixel_bytes(&written), pixel_bytes(&record.path));
            assert_eq!(element_str(&written, tags::PATIENT_NAME), PATIENT_NAME);
            assert_eq!(
                element_str(&written, tags::SOP_INSTANCE_UID),
                element_str(&record.path, tags::SOP_INSTANCE_UID)
            );
            assert_eq!(
                element_str(&written, tags::IMAGE_POSITION_PATIENT),
                element_str(&record.path, tags::IMAGE_POSITION_PATIENT)
            );
        }
        let mut in_names: Vec<String> = series.slices.iter().map(|r| file_name(&r.path)).collect();
        in_names.sort();
        assert_eq!(sorted_names(&out), in_names);
    }

    #[test]
    fn test_short_volume_copies_remaining_slices() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        let paths = write_series(&input, &series_uid(1), 10, 4, 4);
        let catalog = SeriesCatalog::discover(&input).unwrap();
        let series = catalog.first().unwrap();

        let volume = Volume::new(Array3::from_elem((4, 4, 7), -1000.0), IDENTITY_AFFINE);
        let out = temp_dir.path().join("out");
        let report = reinject(series, &volume, SliceAxis::Last, 0, &out).unwrap();
        assert_eq!((report.written, report.replaced, report.copied), (10, 7, 3));
        assert_eq!(sorted_names(&out).len(), 10);

        // -1000 HU with an intercept of -1024 is stored as 24
        let replaced = SampleType::I16.encode(std::iter::repeat(24.0).take(16));
        for (index, path) in paths.iter().enumerate() {
            let written = out.join(path.file_name().unwrap());
            if index < 7 {
                assert_eq!(pixel_bytes(&written), replaced);
            } else {
                assert_eq!(pixel_bytes(&written), pixel_bytes(path));
            }
            assert_eq!(element_str(&written, tags::PATIENT_NAME), PATIENT_NAME);
        }
    }

    #[test]
    fn test_slice_first_volume() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (catalog, volume) = round_trip_volume(temp_dir.path(), 3, 5, 5);
        let slice_first = Volume::new(
            volume.data.clone().permuted_axes([2, 1, 0]).as_standard_layout().to_owned(),
            IDENTITY_AFFINE,
        );
        let reconciliation = Reconciler::default().reconcile(&slice_first, &catalog).unwrap();
        assert_eq!(reconciliation.axis, SliceAxis::First);
        assert_eq!(reconciliation.rotation, 0);

        let out = temp_dir.path().join("out");
        reinject_reconciled(&reconciliation, &slice_first, &out).unwrap();
        for record in &catalog.first().unwrap().slices {
            let written = out.join(record.path.file_name().unwrap());
            assert_eq!(pixel_bytes(&written), pixel_bytes(&record.path));
        }
    }

    #[test]
    fn test_rotation_is_undone() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (catalog, mut volume) = round_trip_volume(temp_dir.path(), 3, 6, 6);
        turn_slices(&mut volume, 3);

        let reconciliation = Reconciler::default().reconcile(&volume, &catalog).unwrap();
        assert_eq!(reconciliation.rotation, 1);
        let out = temp_dir.path().join("out");
        reinject_reconciled(&reconciliation, &volume, &out).unwrap();
        for record in &catalog.first().unwrap().slices {
            let written = out.join(record.path.file_name().unwrap());
            assert_eq!(pixel_bytes(&written), pixel_bytes(&record.path));
        }
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        write_series(&input, &series_uid(1), 10, 4, 4);
        let catalog = SeriesCatalog::discover(&input).unwrap();
        let volume = Volume::new(Array3::zeros((5, 5, 7)), IDENTITY_AFFINE);
        let out = temp_dir.path().join("out");

        let result = reinject(catalog.first().unwrap(), &volume, SliceAxis::Last, 0, &out);
        assert!(matches!(
            result,
            Err(ReinjectError::ShapeMismatch {
                index: 0,
                expected: (4, 4),
                actual: (5, 5),
                ..
            })
        ));
        // Slices past the volume must not be copied through on failure
        assert!(!out.exists());
    }

    #[test]
    fn test_refuses_in_place() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("in");
        let paths = write_series(&input, &series_uid(1), 2, 4, 4);
        let before = pixel_bytes(&paths[0]);
        let catalog = SeriesCatalog::discover(&input).unwrap();
        let volume = Volume::new(Array3::zeros((4, 4, 2)), IDENTITY_AFFINE);

        let result = reinject(catalog.first().unwrap(), &volume, SliceAxis::Last, 0, &input);
        assert!(matches!(result, Err(ReinjectError::InPlace { .. })));
        assert_eq!(pixel_bytes(&paths[0]), before);
    }

    #[test]
    fn test_written_encoding() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (catalog, volume) = round_trip_volume(temp_dir.path(), 2, 4, 4);
        let out = temp_dir.path().join("out");
        reinject(catalog.first().unwrap(), &volume, SliceAxis::Last, 0, &out).unwrap();

        let record = &catalog.first().unwrap().slices[0];
        let written = open_file(out.join(record.path.file_name().unwrap())).unwrap();
        assert_eq!(
            written.meta().transfer_syntax(),
            EXPLICIT_VR_LITTLE_ENDIAN.uid()
        );
        assert_eq!(
            written.element(tags::PIXEL_DATA).unwrap().vr(),
            dicom::core::VR::OW
        );
    }
}
