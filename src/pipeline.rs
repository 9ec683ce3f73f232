//! Batch orchestration: discover cases under a root and run the full round trip on each.
//!
//! Each case gets a private working directory under the work root that is recreated at the
//! start of the case and removed when the case ends, whatever the outcome. Outputs mirror
//! the case's path relative to the input root. A failing case is recorded and the batch
//! moves on to the next one.
use indicatif::ProgressFinish;
use itertools::Itertools;
use snafu::{ResultExt, Snafu};
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};

use crate::catalog::{CatalogError, SeriesCatalog};
use crate::export::{ExportError, Exporter};
use crate::file::{default_bar, DicomFileOperations, DirectoryOperations};
use crate::invoke::{ExternalCommand, InvokeError, ToolInvoker};
use crate::reconcile::{MatchKind, ReconcileError, Reconciler, RotationMode};
use crate::reinject::{reinject_reconciled, ReinjectError, ReinjectReport};
use crate::select::{OutputSelector, SelectError};
use crate::volume::ExtraDimensions;

/// Label of a case found directly in the input root.
pub const ROOT_CASE_LABEL: &str = "__root__";
/// Separator replacing path separators in case labels.
pub const LABEL_SEPARATOR: &str = "__";
pub const VOLUME_IN_DIR: &str = "volume_in";
pub const VOLUME_OUT_DIR: &str = "volume_out";
pub const DEFAULT_WORK_ROOT: &str = "work_deface_batch";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CaseError {
    #[snafu(display("Failed to prepare directory {}: {}", path.display(), source))]
    PrepareDir {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("Catalog failed: {}", source))]
    Catalog {
        #[snafu(source(from(CatalogError, Box::new)))]
        source: Box<CatalogError>,
    },

    #[snafu(display("Export failed: {}", source))]
    Export {
        #[snafu(source(from(ExportError, Box::new)))]
        source: Box<ExportError>,
    },

    #[snafu(display("External tool failed: {}", source))]
    Invoke {
        #[snafu(source(from(InvokeError, Box::new)))]
        source: Box<InvokeError>,
    },

    #[snafu(display("Output selection failed: {}", source))]
    Select {
        #[snafu(source(from(SelectError, Box::new)))]
        source: Box<SelectError>,
    },

    #[snafu(display("Reconciliation failed: {}", source))]
    Reconcile {
        #[snafu(source(from(ReconcileError, Box::new)))]
        source: Box<ReconcileError>,
    },

    #[snafu(display("Reinjection failed: {}", source))]
    Reinject {
        #[snafu(source(from(ReinjectError, Box::new)))]
        source: Box<ReinjectError>,
    },

    #[snafu(display("Failed to archive {} to {}: {}", from.display(), to.display(), source))]
    Archive {
        from: PathBuf,
        to: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BatchError {
    #[snafu(display("Failed to list cases under {}: {}", path.display(), source))]
    ListCases {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("No DICOM cases found under {}", path.display()))]
    NoCases { path: PathBuf },

    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    CreateRoot {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },
}

/// Case directories under `root`: the root itself when it directly holds DICOM files, then
/// every immediate subdirectory that does. Deeper directories are not searched.
pub fn find_case_dirs<P: AsRef<Path>>(root: P) -> std::io::Result<Vec<PathBuf>> {
    let root = root.as_ref();
    let mut cases = Vec::new();
    if root.has_dicoms() {
        cases.push(root.to_path_buf());
    }
    for dir in root.subdirectories()? {
        if dir.has_dicoms() {
            cases.push(dir);
        }
    }
    Ok(cases.into_iter().unique().collect())
}

/// Working directory name for a case at `relative` to the input root.
pub fn case_label(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        ROOT_CASE_LABEL.to_string()
    } else {
        parts.join(LABEL_SEPARATOR)
    }
}

/// Where one case reads from and writes to.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseContext {
    pub case_dir: PathBuf,
    pub relative: PathBuf,
    pub label: String,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

impl CaseContext {
    pub fn new(case_dir: &Path, layout: &BatchLayout) -> Self {
        let relative = case_dir
            .strip_prefix(&layout.source)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let label = case_label(&relative);
        Self {
            case_dir: case_dir.to_path_buf(),
            output_dir: layout.output.join(&relative),
            work_dir: layout.work_root.join(&label),
            archive_dir: layout.volume_archive.as_ref().map(|a| a.join(&relative)),
            relative,
            label,
        }
    }

    pub fn volume_in_dir(&self) -> PathBuf {
        self.work_dir.join(VOLUME_IN_DIR)
    }

    pub fn volume_out_dir(&self) -> PathBuf {
        self.work_dir.join(VOLUME_OUT_DIR)
    }
}

/// A case working directory, removed when dropped unless kept.
struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    fn create(path: &Path, keep: bool) -> std::io::Result<Self> {
        path.recreate_dir()?;
        Ok(Self {
            path: path.to_path_buf(),
            keep,
        })
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            info!("Keeping working directory {}", self.path.display());
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!("Failed to remove working directory {}: {}", self.path.display(), e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub rotation: RotationMode,
    /// Passed to the external tool verbatim after the input and output directories.
    pub extra_args: Vec<String>,
    pub keep_work: bool,
    /// Export this series instead of the first one found.
    pub series: Option<String>,
    pub extra_dims: ExtraDimensions,
    pub channel_suffix: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            rotation: RotationMode::default(),
            extra_args: Vec::new(),
            keep_work: false,
            series: None,
            extra_dims: ExtraDimensions::default(),
            channel_suffix: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub label: String,
    pub exported_series: String,
    pub exit_code: Option<i32>,
    pub selected: PathBuf,
    pub changed_voxels: Option<usize>,
    pub archived: Option<PathBuf>,
    pub matched_series: String,
    pub kind: MatchKind,
    pub rotation: u8,
    pub reinject: ReinjectReport,
}

/// Run the full round trip for one case.
pub fn process_case(
    ctx: &CaseContext,
    command: &dyn ExternalCommand,
    options: &PipelineOptions,
) -> Result<CaseReport, CaseError> {
    info!("[{}] Processing {}", ctx.label, ctx.case_dir.display());
    let _work = WorkDir::create(&ctx.work_dir, options.keep_work)
        .context(PrepareDirSnafu { path: &ctx.work_dir })?;
    let volume_in = ctx.volume_in_dir();
    let volume_out = ctx.volume_out_dir();
    std::fs::create_dir_all(&volume_in).context(PrepareDirSnafu { path: &volume_in })?;

    info!("[{}] Step 1: cataloguing series", ctx.label);
    let catalog = SeriesCatalog::discover(&ctx.case_dir).context(CatalogSnafu)?;

    info!("[{}] Step 2: exporting volume", ctx.label);
    let exporter = Exporter {
        channel_suffix: options.channel_suffix,
    };
    let export = exporter
        .export(&catalog, options.series.as_deref(), &volume_in)
        .context(ExportSnafu)?;

    info!("[{}] Step 3: running {}", ctx.label, command.describe());
    let invocation = ToolInvoker::new(command)
        .invoke(&volume_in, &volume_out, &options.extra_args)
        .context(InvokeSnafu)?;

    info!("[{}] Step 4: selecting output", ctx.label);
    let selection = OutputSelector::new(options.extra_dims)
        .select(&volume_out, &export.path)
        .context(SelectSnafu)?;

    let archived = match &ctx.archive_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context(PrepareDirSnafu { path: dir })?;
            let file_name = selection
                .path
                .file_name()
                .unwrap_or(selection.path.as_os_str());
            let target = dir.join(file_name);
            std::fs::copy(&selection.path, &target).context(ArchiveSnafu {
                from: &selection.path,
                to: &target,
            })?;
            info!("[{}] Archived volume to {}", ctx.label, target.display());
            Some(target)
        }
        None => None,
    };

    info!("[{}] Step 5: reconciling geometry", ctx.label);
    let reconciliation = Reconciler::new(options.rotation)
        .reconcile(&selection.volume, &catalog)
        .context(ReconcileSnafu)?;

    info!("[{}] Step 6: writing slices to {}", ctx.label, ctx.output_dir.display());
    let reinject = reinject_reconciled(&reconciliation, &selection.volume, &ctx.output_dir)
        .context(ReinjectSnafu)?;

    info!("[{}] Done", ctx.label);
    Ok(CaseReport {
        label: ctx.label.clone(),
        exported_series: export.series_uid,
        exit_code: invocation.exit_code,
        selected: selection.path,
        changed_voxels: selection.changed_voxels,
        archived,
        matched_series: reconciliation.series.uid.clone(),
        kind: reconciliation.kind,
        rotation: reconciliation.rotation,
        reinject,
    })
}

/// Input, output and scratch roots of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchLayout {
    pub source: PathBuf,
    pub output: PathBuf,
    pub volume_archive: Option<PathBuf>,
    pub work_root: PathBuf,
}

impl BatchLayout {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(source: P, output: Q) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            volume_archive: None,
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseFailure {
    pub label: String,
    pub case_dir: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: Vec<CaseReport>,
    pub failed: Vec<CaseFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prepare_batch(layout: &BatchLayout) -> Result<Vec<CaseContext>, BatchError> {
    let cases = find_case_dirs(&layout.source).context(ListCasesSnafu {
        path: &layout.source,
    })?;
    if cases.is_empty() {
        return NoCasesSnafu {
            path: &layout.source,
        }
        .fail();
    }
    let roots = [Some(&layout.output), layout.volume_archive.as_ref(), Some(&layout.work_root)];
    for root in roots.into_iter().flatten() {
        std::fs::create_dir_all(root).context(CreateRootSnafu { path: root })?;
    }
    info!(
        "Found {} cases under {}: {}",
        cases.len(),
        layout.source.display(),
        cases.iter().map(|c| c.display()).join(", ")
    );
    Ok(cases
        .iter()
        .map(|case_dir| CaseContext::new(case_dir, layout))
        .collect())
}

fn run_cases<F: FnMut(&CaseContext)>(
    contexts: &[CaseContext],
    command: &dyn ExternalCommand,
    options: &PipelineOptions,
    mut on_case_done: F,
) -> BatchReport {
    let mut report = BatchReport::default();
    for ctx in contexts {
        match process_case(ctx, command, options) {
            Ok(case) => report.succeeded.push(case),
            Err(e) => {
                error!(
                    "[{}] Case failed: {}",
                    ctx.label,
                    snafu::Report::from_error(&e)
                );
                report.failed.push(CaseFailure {
                    label: ctx.label.clone(),
                    case_dir: ctx.case_dir.clone(),
                    error: snafu::Report::from_error(&e).to_string(),
                });
            }
        }
        on_case_done(ctx);
    }
    info!(
        "Processed {} cases: {} succeeded, {} failed",
        report.len(),
        report.succeeded.len(),
        report.failed.len()
    );
    report
}

/// Run every case under `layout.source` in turn.
pub fn run_all(
    layout: &BatchLayout,
    command: &dyn ExternalCommand,
    options: &PipelineOptions,
) -> Result<BatchReport, BatchError> {
    let contexts = prepare_batch(layout)?;
    Ok(run_cases(&contexts, command, options, |_| {}))
}

/// Like [`run_all`], with a progress bar over cases.
pub fn run_all_with_progress(
    layout: &BatchLayout,
    command: &dyn ExternalCommand,
    options: &PipelineOptions,
) -> Result<BatchReport, BatchError> {
    let contexts = prepare_batch(layout)?;
    let pb = default_bar(contexts.len() as u64).with_finish(ProgressFinish::AndLeave);
    pb.set_message("Defacing cases");
    let report = run_cases(&contexts, command, options, |ctx| {
        pb.set_message(ctx.label.clone());
        pb.inc(1);
    });
    pb.finish();
    Ok(report)
}
