use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::NiftiError;
use crate::export::CHANNEL_SUFFIX;
use crate::file::NiftiFileOperations;
use crate::volume::{ExtraDimensions, Volume};

pub const MASK_MARKER: &str = "mask";
pub const DEFACED_MARKER: &str = "defaced";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SelectError {
    #[snafu(display("Failed to list output directory {}: {}", path.display(), source))]
    ListOutput {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display(
        "Only mask volumes were produced in {}: {:?}",
        output_dir.display(),
        masks
    ))]
    OnlyMasksProduced {
        output_dir: PathBuf,
        masks: Vec<String>,
    },

    #[snafu(display(
        "Cannot choose between {} candidate volumes in {} for input stem '{}': {:?}",
        candidates.len(),
        output_dir.display(),
        stem,
        candidates
    ))]
    AmbiguousOutput {
        output_dir: PathBuf,
        stem: String,
        candidates: Vec<String>,
    },

    #[snafu(display(
        "Output {} is voxel-identical to input {} (shape {:?}), the tool did nothing",
        path.display(),
        input.display(),
        shape
    ))]
    NoOpDefacing {
        path: PathBuf,
        input: PathBuf,
        shape: [usize; 3],
    },

    #[snafu(display("Failed to load volume: {}", source))]
    LoadVolume {
        #[snafu(source(from(NiftiError, Box::new)))]
        source: Box<NiftiError>,
    },
}

/// Role of a tool output, judged from its file name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Mask,
    Candidate,
    Unclassified,
}

/// Classify a file name. A mask marker wins over a defaced marker.
pub fn classify(file_name: &str) -> OutputKind {
    let name = file_name.to_lowercase();
    if name.contains(MASK_MARKER) {
        OutputKind::Mask
    } else if name.contains(DEFACED_MARKER) {
        OutputKind::Candidate
    } else {
        OutputKind::Unclassified
    }
}

/// File stem with the volume extension and channel suffix removed.
pub fn case_stem<P: AsRef<Path>>(path: P) -> Option<String> {
    let stem = path.as_ref().nifti_stem()?;
    Some(match stem.strip_suffix(CHANNEL_SUFFIX) {
        Some(stripped) => stripped.to_string(),
        None => stem,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_names(paths: &[&PathBuf]) -> Vec<String> {
    paths.iter().map(|p| file_name(p)).collect()
}

/// The volume chosen to replace the input, with the number of voxels it changed.
#[derive(Debug, Clone)]
pub struct Selection {
    pub path: PathBuf,
    pub volume: Volume,
    /// `None` when the shape differs from the input.
    pub changed_voxels: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct OutputSelector {
    pub extra_dims: ExtraDimensions,
}

impl OutputSelector {
    pub fn new(extra_dims: ExtraDimensions) -> Self {
        Self { extra_dims }
    }

    /// Pick the output meant to replace `input_volume` by name alone.
    pub fn choose<P: AsRef<Path>>(
        &self,
        outputs: &[PathBuf],
        input_volume: P,
        output_dir: &Path,
    ) -> Result<PathBuf, SelectError> {
        let kinds: Vec<(&PathBuf, OutputKind)> = outputs
            .iter()
            .map(|p| (p, classify(&file_name(p))))
            .collect();

        let defaced: Vec<&PathBuf> = kinds
            .iter()
            .filter(|(_, k)| *k == OutputKind::Candidate)
            .map(|(p, _)| *p)
            .collect();
        let candidates: Vec<&PathBuf> = if !defaced.is_empty() {
            defaced
        } else {
            kinds
                .iter()
                .filter(|(_, k)| *k != OutputKind::Mask)
                .map(|(p, _)| *p)
                .collect()
        };
        if candidates.is_empty() {
            return OnlyMasksProducedSnafu {
                output_dir,
                masks: outputs.iter().map(|p| file_name(p)).collect::<Vec<_>>(),
            }
            .fail();
        }

        let stem = case_stem(input_volume.as_ref()).unwrap_or_default();
        let matching: Vec<&PathBuf> = candidates
            .iter()
            .filter(|p| {
                !stem.is_empty() && case_stem(p).is_some_and(|s| s.starts_with(stem.as_str()))
            })
            .copied()
            .collect();
        let candidates = if matching.is_empty() {
            candidates
        } else {
            matching
        };

        match candidates.as_slice() {
            [single] => Ok((*single).clone()),
            _ => AmbiguousOutputSnafu {
                output_dir,
                stem,
                candidates: file_names(&candidates),
            }
            .fail(),
        }
    }

    /// Choose among the volumes in `output_dir` and verify the choice changed something.
    pub fn select<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        output_dir: P,
        input_volume: Q,
    ) -> Result<Selection, SelectError> {
        let output_dir = output_dir.as_ref();
        let input_volume = input_volume.as_ref();
        let outputs = output_dir
            .find_niftis()
            .context(ListOutputSnafu { path: output_dir })?;
        let path = self.choose(&outputs, input_volume, output_dir)?;
        info!("Selected output volume {}", path.display());

        let input = Volume::open_with(input_volume, self.extra_dims).context(LoadVolumeSnafu)?;
        let volume = Volume::open_with(&path, self.extra_dims).context(LoadVolumeSnafu)?;
        let changed_voxels = volume.count_differing(&input);
        match changed_voxels {
            Some(0) => {
                return NoOpDefacingSnafu {
                    path,
                    input: input_volume,
                    shape: volume.shape(),
                }
                .fail()
            }
            Some(n) => info!("Output changed {} of {} voxels", n, volume.data.len()),
            None => warn!(
                "Output shape {:?} differs from input shape {:?}, skipping the change check",
                volume.shape(),
                input.shape()
            ),
        }
        Ok(Selection {
            path,
            volume,
            changed_voxels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::IDENTITY_AFFINE;
    use crate::volume::VoxelType;
    use ndarray::Array3;
    use rstest::rstest;

    #[rstest]
    #[case::mask("case_mask.nii.gz", OutputKind::Mask)]
    #[case::defaced("case_defaced.nii.gz", OutputKind::Candidate)]
    #[case::upper_case("CASE_DEFACED.nii.gz", OutputKind::Candidate)]
    #[case::defaced_mask("case_defaced_mask.nii.gz", OutputKind::Mask)]
    #[case::raw_prediction("case.nii.gz", OutputKind::Unclassified)]
    fn test_classify(#[case] name: &str, #[case] expected: OutputKind) {
        assert_eq!(classify(name), expected);
    }

    #[rstest]
    #[case::channel("dir/case_0000.nii.gz", Some("case"))]
    #[case::plain("case_defaced.nii", Some("case_defaced"))]
    #[case::not_volume("case.dcm", None)]
    fn test_case_stem(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(case_stem(path).as_deref(), expected);
    }

    fn choose(names: &[&str], input: &str) -> Result<String, SelectError> {
        let dir = PathBuf::from("/out");
        let outputs: Vec<PathBuf> = names.iter().map(|n| dir.join(n)).collect();
        OutputSelector::default()
            .choose(&outputs, input, &dir)
            .map(|p| file_name(&p))
    }

    #[rstest]
    #[case::defaced_over_mask(&["case_defaced.nii.gz", "case_mask.nii.gz"], "case_defaced.nii.gz")]
    #[case::defaced_over_raw(&["case.nii.gz", "case_defaced.nii.gz", "case_mask.nii.gz"], "case_defaced.nii.gz")]
    #[case::non_mask_fallback(&["case.nii.gz", "case_mask.nii.gz"], "case.nii.gz")]
    #[case::stem_narrows(&["case_defaced.nii.gz", "other_defaced.nii.gz"], "case_defaced.nii.gz")]
    fn test_choose(#[case] names: &[&str], #[case] expected: &str) {
        assert_eq!(choose(names, "/in/case_0000.nii.gz").unwrap(), expected);
    }

    #[test]
    fn test_choose_only_masks() {
        let result = choose(&["case_mask.nii.gz"], "/in/case_0000.nii.gz");
        assert!(matches!(
            result,
            Err(SelectError::OnlyMasksProduced { masks, .. }) if masks == vec!["case_mask.nii.gz"]
        ));
    }

    #[test]
    fn test_choose_ambiguous() {
        let result = choose(
            &["a_defaced.nii.gz", "b_defaced.nii.gz"],
            "/in/case_0000.nii.gz",
        );
        assert!(matches!(
            result,
            Err(SelectError::AmbiguousOutput { candidates, .. }) if candidates.len() == 2
        ));
    }

    fn write(path: &Path, data: &Array3<f32>) {
        Volume::new(data.clone(), IDENTITY_AFFINE)
            .save(path, VoxelType::Int16)
            .unwrap();
    }

    #[test]
    fn test_select_detects_noop() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("case_0000.nii.gz");
        let out = temp_dir.path().join("out");
        let data = Array3::from_shape_fn((3, 4, 4), |(i, j, k)| (i * 16 + j * 4 + k) as f32);
        write(&input, &data);
        write(&out.join("case_defaced.nii.gz"), &data);
        write(&out.join("case_mask.nii.gz"), &Array3::zeros((3, 4, 4)));

        let result = OutputSelector::default().select(&out, &input);
        assert!(matches!(
            result,
            Err(SelectError::NoOpDefacing { shape: [3, 4, 4], .. })
        ));
    }

    #[test]
    fn test_select_counts_changes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("case_0000.nii.gz");
        let out = temp_dir.path().join("out");
        let data = Array3::from_shape_fn((3, 4, 4), |(i, j, k)| (i * 16 + j * 4 + k) as f32);
        let mut defaced = data.clone();
        defaced[[0, 0, 0]] = -1000.0;
        defaced[[2, 3, 3]] = -1000.0;
        write(&input, &data);
        write(&out.join("case_defaced.nii.gz"), &defaced);

        let selection = OutputSelector::default().select(&out, &input).unwrap();
        assert_eq!(selection.path, out.join("case_defaced.nii.gz"));
        assert_eq!(selection.changed_voxels, Some(2));
        assert_eq!(selection.volume.data, defaced);
    }

    #[test]
    fn test_select_shape_mismatch_bypasses_check() {
        let temp_dir = tempfile::tempdir().unwrap();
        let input = temp_dir.path().join("case_0000.nii.gz");
        let out = temp_dir.path().join("out");
        write(&input, &Array3::zeros((3, 4, 4)));
        write(&out.join("case_defaced.nii.gz"), &Array3::zeros((2, 4, 4)));

        let selection = OutputSelector::default().select(&out, &input).unwrap();
        assert_eq!(selection.changed_voxels, None);
    }
}
