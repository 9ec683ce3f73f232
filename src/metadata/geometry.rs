use crate::metadata::SliceHeader;

/// Row-major 4x4 transform from voxel indices to millimetres.
pub type Affine = [[f64; 4]; 4];

pub const IDENTITY_AFFINE: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
}

/// Build an affine from three axis vectors (one per array index) and an origin.
fn from_columns(axes: [[f64; 3]; 3], origin: [f64; 3]) -> Affine {
    let mut affine = IDENTITY_AFFINE;
    for row in 0..3 {
        for (col, axis) in axes.iter().enumerate() {
            affine[row][col] = axis[row];
        }
        affine[row][3] = origin[row];
    }
    affine
}

/// Affine of a series stacked as (column, row, slice), in RAS coordinates.
///
/// Uses the first slice's position and orientation, the mean step between the first and
/// last slice positions, and the pixel spacing. With a single slice, the step is the
/// slice normal scaled by the slice thickness. Returns `None` when the first slice lacks
/// position, orientation or spacing.
pub fn series_affine(first: &SliceHeader, last: &SliceHeader, count: usize) -> Option<Affine> {
    let origin = first.image_position?;
    let [rx, ry, rz, cx, cy, cz] = first.image_orientation?;
    let [row_spacing, column_spacing] = first.pixel_spacing?;
    let row_cosines = [rx, ry, rz];
    let column_cosines = [cx, cy, cz];

    let step = match (count, last.image_position) {
        (n, Some(end)) if n > 1 && end != origin => scale(sub(end, origin), 1.0 / (n - 1) as f64),
        _ => {
            let normal = cross(row_cosines, column_cosines);
            scale(normal, first.slice_thickness.filter(|t| *t > 0.0).unwrap_or(1.0))
        }
    };

    // Increasing column index moves along the row cosines and vice versa
    let lps = from_columns(
        [
            scale(row_cosines, column_spacing),
            scale(column_cosines, row_spacing),
            step,
        ],
        origin,
    );
    Some(lps_to_ras(lps))
}

/// Flip the first two world axes, converting LPS to RAS or back.
pub fn lps_to_ras(mut affine: Affine) -> Affine {
    for row in affine.iter_mut().take(2) {
        for value in row.iter_mut() {
            *value = -*value;
        }
    }
    affine
}

/// Voxel edge lengths along each array index.
pub fn voxel_sizes(affine: &Affine) -> [f64; 3] {
    let mut sizes = [0.0; 3];
    for (col, size) in sizes.iter_mut().enumerate() {
        *size = norm([affine[0][col], affine[1][col], affine[2][col]]);
    }
    sizes
}

/// Affine from a unit quaternion (b, c, d), voxel sizes, handedness factor and offset.
pub fn quaternion_affine(
    [b, c, d]: [f64; 3],
    voxel_sizes: [f64; 3],
    qfac: f64,
    offset: [f64; 3],
) -> Affine {
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let rotation = [
        [
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
        ],
        [
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
        ],
        [
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - b * b - c * c,
        ],
    ];
    let qfac = if qfac < 0.0 { -1.0 } else { 1.0 };
    let zooms = [voxel_sizes[0], voxel_sizes[1], voxel_sizes[2] * qfac];
    let mut affine = IDENTITY_AFFINE;
    for row in 0..3 {
        for col in 0..3 {
            affine[row][col] = rotation[row][col] * zooms[col];
        }
        affine[row][3] = offset[row];
    }
    affine
}
