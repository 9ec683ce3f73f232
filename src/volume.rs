//! Volume-format artifacts: a dense 3D array with an affine, read from and written to NIfTI.
use ndarray::{Array3, ArrayD, ArrayView2, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use snafu::ResultExt;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::nifti::{CreateDirSnafu, ReadSnafu, WriteSnafu};
use crate::errors::NiftiError;
use crate::metadata::{quaternion_affine, voxel_sizes, Affine, IDENTITY_AFFINE};

/// NIfTI spatial units code for millimetres.
const UNITS_MM: u8 = 2;

/// How to treat volumes with a genuine fourth dimension.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExtraDimensions {
    /// Fail on anything that is not three-dimensional.
    #[default]
    Reject,
    /// Keep index 0 along the fourth dimension.
    FirstIndex,
}

impl fmt::Display for ExtraDimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtraDimensions::Reject => "reject",
            ExtraDimensions::FirstIndex => "first-index",
        };
        write!(f, "{s}")
    }
}

/// Which array dimension enumerates the slices of a series.
///
/// Exported volumes are laid out (column, row, slice), so `Last` is the usual case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceAxis {
    First,
    Last,
}

impl SliceAxis {
    pub fn index(&self) -> usize {
        match self {
            SliceAxis::First => 0,
            SliceAxis::Last => 2,
        }
    }
}

impl fmt::Display for SliceAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SliceAxis::First => "first",
            SliceAxis::Last => "last",
        };
        write!(f, "{s}")
    }
}

/// On-disk voxel type used when saving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelType {
    Int16,
    Float32,
}

impl VoxelType {
    /// 16-bit integers when every value is integral and in range, else 32-bit floats.
    pub fn infer(data: &Array3<f32>) -> Self {
        let fits = data
            .iter()
            .all(|&v| v.fract() == 0.0 && v >= i16::MIN as f32 && v <= i16::MAX as f32);
        if fits {
            VoxelType::Int16
        } else {
            VoxelType::Float32
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub affine: Affine,
    pub path: Option<PathBuf>,
}

/// Affine from the sform when set, else the qform quaternion, else the voxel sizes.
pub fn header_affine(header: &NiftiHeader) -> Affine {
    let pixdim = header.pixdim.map(|v| v as f64);
    let zooms = [pixdim[1], pixdim[2], pixdim[3]].map(|v| if v > 0.0 { v } else { 1.0 });
    if header.sform_code > 0 {
        let rows = [header.srow_x, header.srow_y, header.srow_z];
        let mut affine = IDENTITY_AFFINE;
        for (row, srow) in affine.iter_mut().zip(rows) {
            *row = srow.map(|v| v as f64);
        }
        affine
    } else if header.qform_code > 0 {
        quaternion_affine(
            [header.quatern_b, header.quatern_c, header.quatern_d].map(|v| v as f64),
            zooms,
            pixdim[0],
            [header.quatern_x, header.quatern_y, header.quatern_z].map(|v| v as f64),
        )
    } else {
        let mut affine = IDENTITY_AFFINE;
        for (i, zoom) in zooms.into_iter().enumerate() {
            affine[i][i] = zoom;
        }
        affine
    }
}

/// Drop trailing singleton dimensions, then apply the extra-dimension policy.
fn into_3d(
    mut data: ArrayD<f32>,
    extra: ExtraDimensions,
    path: &Path,
) -> Result<Array3<f32>, NiftiError> {
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.remove_axis(Axis(last));
    }
    if data.ndim() == 4 && extra == ExtraDimensions::FirstIndex {
        tracing::warn!(
            "Volume {} has shape {:?}, keeping index 0 of the fourth dimension",
            path.display(),
            data.shape()
        );
        data = data.index_axis_move(Axis(3), 0);
    }
    let shape = data.shape().to_vec();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| NiftiError::UnsupportedDimensionality {
            path: path.to_path_buf(),
            ndim: shape.len(),
            shape,
        })
}

impl Volume {
    pub fn new(data: Array3<f32>, affine: Affine) -> Self {
        Self {
            data,
            affine,
            path: None,
        }
    }

    /// Read a three-dimensional volume, rejecting higher dimensionality.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NiftiError> {
        Self::open_with(path, ExtraDimensions::Reject)
    }

    pub fn open_with<P: AsRef<Path>>(path: P, extra: ExtraDimensions) -> Result<Self, NiftiError> {
        let path = path.as_ref();
        let object = ReaderOptions::new()
            .read_file(path)
            .context(ReadSnafu { path })?;
        let affine = header_affine(object.header());
        let data = object
            .into_volume()
            .into_ndarray::<f32>()
            .context(ReadSnafu { path })?;
        let data = into_3d(data, extra, path)?;
        tracing::debug!("Read volume {} with shape {:?}", path.display(), data.shape());
        Ok(Self {
            data,
            affine,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn shape(&self) -> [usize; 3] {
        let (a, b, c) = self.data.dim();
        [a, b, c]
    }

    /// Extent along the given slice axis.
    pub fn slice_count(&self, axis: SliceAxis) -> usize {
        self.data.len_of(Axis(axis.index()))
    }

    /// The plane at `index` along the given slice axis, as (row, column).
    ///
    /// A slice-first volume is read as (slice, row, column). A slice-last volume is
    /// (column, row, slice), so its planes are transposed back.
    pub fn plane(&self, axis: SliceAxis, index: usize) -> ArrayView2<'_, f32> {
        let plane = self.data.index_axis(Axis(axis.index()), index);
        match axis {
            SliceAxis::First => plane,
            SliceAxis::Last => plane.reversed_axes(),
        }
    }

    /// Number of voxels that differ from `other`, or `None` when the shapes differ.
    pub fn count_differing(&self, other: &Volume) -> Option<usize> {
        if self.data.shape() != other.data.shape() {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .filter(|(a, b)| a != b)
                .count(),
        )
    }

    fn reference_header(&self) -> NiftiHeader {
        let mut header = NiftiHeader::default();
        let zooms = voxel_sizes(&self.affine);
        header.pixdim = [
            1.0,
            zooms[0] as f32,
            zooms[1] as f32,
            zooms[2] as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ];
        header.sform_code = 1;
        header.qform_code = 0;
        header.srow_x = self.affine[0].map(|v| v as f32);
        header.srow_y = self.affine[1].map(|v| v as f32);
        header.srow_z = self.affine[2].map(|v| v as f32);
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        header.xyzt_units = UNITS_MM;
        header
    }

    /// Write the volume. Compression follows the file extension.
    pub fn save<P: AsRef<Path>>(&self, path: P, voxel_type: VoxelType) -> Result<(), NiftiError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context(CreateDirSnafu { path: parent })?;
        }
        let header = self.reference_header();
        let writer = WriterOptions::new(path).reference_header(&header);
        let result = match voxel_type {
            VoxelType::Int16 => writer.write_nifti(&self.data.mapv(|v| v as i16)),
            VoxelType::Float32 => writer.write_nifti(&self.data),
        };
        result.context(WriteSnafu { path })?;
        tracing::debug!("Wrote volume {} as {:?}", path.display(), voxel_type);
        Ok(())
    }
}
