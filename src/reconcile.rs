//! Mapping a returned volume back onto the series it came from.
//!
//! Matching works on slice counts only. The volume's first and last dimensions are both
//! tried as the slice axis, with the first dimension winning whenever it matches. When no
//! series matches exactly, the series with the nearest slice count is used.
//!
//! Orientation is settled once per case: the plane at the middle of the overlapping range
//! is compared against the original slice at the same index under each allowed quarter
//! turn, and the turn with the smallest mean squared difference is applied to every slice.
use ndarray::{s, Array2, ArrayView2};
use snafu::Snafu;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::catalog::{Series, SeriesCatalog, SliceRecord};
use crate::errors::DicomError;
use crate::file::DicomFileOperations;
use crate::metadata::{decode_stored_values, SliceHeader};
use crate::volume::{SliceAxis, Volume};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReconcileError {
    #[snafu(display("No series to match the volume against in {}", path.display()))]
    EmptyCatalog { path: PathBuf },
}

/// Which quarter turns the orientation search may choose from.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RotationMode {
    /// Never rotate.
    Disabled,
    /// Search 0, 90 and 270 degrees. Half turns are excluded.
    #[default]
    Restricted,
    /// Search all four quarter turns.
    Full,
}

impl RotationMode {
    /// Allowed counts of counter-clockwise quarter turns, in search order.
    pub fn candidates(&self) -> &'static [u8] {
        match self {
            RotationMode::Disabled => &[0],
            RotationMode::Restricted => &[0, 1, 3],
            RotationMode::Full => &[0, 1, 2, 3],
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RotationMode::Disabled => "disabled",
            RotationMode::Restricted => "restricted",
            RotationMode::Full => "full",
        };
        write!(f, "{s}")
    }
}

/// Rotate a plane by `k` counter-clockwise quarter turns, as a view.
pub fn rot90<T>(plane: ArrayView2<'_, T>, k: u8) -> ArrayView2<'_, T> {
    match k % 4 {
        0 => plane,
        1 => plane.reversed_axes().slice_move(s![..;-1, ..]),
        2 => plane.slice_move(s![..;-1, ..;-1]),
        _ => plane.reversed_axes().slice_move(s![.., ..;-1]),
    }
}

fn mean_squared_error(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>) -> f64 {
    let n = a.len().max(1) as f64;
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = (x - y) as f64;
            d * d
        })
        .sum::<f64>()
        / n
}

/// Map a plane in output units to the stored sample domain of `header`.
pub fn to_stored_plane(
    plane: ArrayView2<'_, f32>,
    header: &SliceHeader,
) -> Result<Array2<f64>, DicomError> {
    let sample_type = header.sample_type()?;
    let rescale = header.rescale;
    if rescale.is_identity() {
        return Ok(plane.mapv(|v| sample_type.quantize(v as f64)));
    }
    Ok(plane.mapv(|v| sample_type.quantize(rescale.invert(v as f64))))
}

/// Decode a slice's stored values as a (rows, columns) plane.
fn reference_plane(record: &SliceRecord) -> Option<Array2<f32>> {
    let header = &record.header;
    let file = match record.path.dcmread() {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot read reference slice {}: {}", record.path.display(), e);
            return None;
        }
    };
    let values = match decode_stored_values(&file, header) {
        Ok(values) => values,
        Err(e) => {
            warn!("Cannot decode reference slice {}: {}", record.path.display(), e);
            return None;
        }
    };
    let values = values.into_iter().map(|v| v as f32).collect();
    Array2::from_shape_vec((header.rows, header.columns), values).ok()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchKind {
    Exact,
    /// No series matched; `difference` slices separate the chosen series from the volume.
    Closest { difference: usize },
}

/// Series, slice axis and rotation chosen for a volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation<'a> {
    pub series: &'a Series,
    pub axis: SliceAxis,
    pub rotation: u8,
    pub kind: MatchKind,
    /// Slices present in both the volume and the series.
    pub overlap: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    pub mode: RotationMode,
}

impl Reconciler {
    pub fn new(mode: RotationMode) -> Self {
        Self { mode }
    }

    /// Choose the series and slice axis for a volume of the given shape.
    pub fn match_series<'a>(
        &self,
        shape: [usize; 3],
        catalog: &'a SeriesCatalog,
    ) -> Result<(&'a Series, SliceAxis, MatchKind), ReconcileError> {
        let (first_extent, last_extent) = (shape[0], shape[2]);
        let on_first: Vec<&Series> = catalog.iter().filter(|s| s.len() == first_extent).collect();
        let on_last: Vec<&Series> = catalog.iter().filter(|s| s.len() == last_extent).collect();

        let exact = match (on_first.first(), on_last.first()) {
            (Some(series), _) => Some((*series, SliceAxis::First, on_first.len())),
            (None, Some(series)) => Some((*series, SliceAxis::Last, on_last.len())),
            (None, None) => None,
        };
        if let Some((series, axis, matches)) = exact {
            if matches > 1 {
                warn!(
                    "{} series have {} slices, using {}",
                    matches,
                    series.len(),
                    series.uid
                );
            }
            return Ok((series, axis, MatchKind::Exact));
        }

        let mut best: Option<(&Series, usize)> = None;
        for series in catalog.iter() {
            let n = series.len();
            let difference = n.abs_diff(first_extent).min(n.abs_diff(last_extent));
            if best.map_or(true, |(_, d)| difference < d) {
                best = Some((series, difference));
            }
        }
        let (series, difference) = best.ok_or_else(|| ReconcileError::EmptyCatalog {
            path: catalog.dir().to_path_buf(),
        })?;
        let n = series.len();
        let axis = if n.abs_diff(first_extent) <= n.abs_diff(last_extent) {
            SliceAxis::First
        } else {
            SliceAxis::Last
        };
        warn!(
            "No series matches volume shape {:?}, using closest series {} ({} slices, off by {})",
            shape, series.uid, n, difference
        );
        Ok((series, axis, MatchKind::Closest { difference }))
    }

    /// Quarter turns of `candidate` that best reproduce `reference`.
    /// Falls back to no rotation when the planes differ in shape.
    pub fn best_rotation(&self, candidate: ArrayView2<'_, f32>, reference: ArrayView2<'_, f32>) -> u8 {
        if self.mode == RotationMode::Disabled {
            return 0;
        }
        if candidate.dim() != reference.dim() {
            debug!(
                "Plane shapes {:?} and {:?} differ, not rotating",
                candidate.dim(),
                reference.dim()
            );
            return 0;
        }
        let mut best: Option<(u8, f64)> = None;
        for &k in self.mode.candidates() {
            let rotated = rot90(candidate.view(), k);
            if rotated.dim() != reference.dim() {
                continue;
            }
            let error = mean_squared_error(rotated, reference.view());
            debug!("Rotation k={} has mean squared error {}", k, error);
            if best.map_or(true, |(_, e)| error < e) {
                best = Some((k, error));
            }
        }
        best.map_or(0, |(k, _)| k)
    }

    /// Match `volume` to a series in `catalog` and settle its orientation.
    pub fn reconcile<'a>(
        &self,
        volume: &Volume,
        catalog: &'a SeriesCatalog,
    ) -> Result<Reconciliation<'a>, ReconcileError> {
        let (series, axis, kind) = self.match_series(volume.shape(), catalog)?;
        let extent = volume.slice_count(axis);
        let overlap = extent.min(series.len());
        if extent != series.len() {
            warn!(
                "Volume has {} slices along the {} axis but series {} has {}, updating the first {}",
                extent,
                axis,
                series.uid,
                series.len(),
                overlap
            );
        }

        let rotation = match (self.mode, overlap) {
            (RotationMode::Disabled, _) | (_, 0) => 0,
            _ => {
                let index = if overlap == 1 { 0 } else { overlap / 2 };
                let record = &series.slices[index];
                match reference_plane(record) {
                    Some(reference) => {
                        let candidate = to_stored_plane(volume.plane(axis, index), &record.header)
                            .map(|plane| plane.mapv(|v| v as f32));
                        match candidate {
                            Ok(candidate) => self.best_rotation(candidate.view(), reference.view()),
                            Err(e) => {
                                warn!("Cannot compare planes for rotation: {}", e);
                                0
                            }
                        }
                    }
                    None => 0,
                }
            }
        };

        info!(
            "Matched series {} ({} slices) on the {} axis, rotation k={}, {:?}",
            series.uid,
            series.len(),
            axis,
            rotation,
            kind
        );
        Ok(Reconciliation {
            series,
            axis,
            rotation,
            kind,
            overlap,
        })
    }
}
