use clap::Parser;
use snafu::{Report, ResultExt, Snafu, Whatever};
use std::path::PathBuf;
use tracing::{error, Level};

use dicom_deface::invoke::ProcessCommand;
use dicom_deface::pipeline::{
    run_all_with_progress, BatchError, BatchLayout, BatchReport, PipelineOptions,
    DEFAULT_WORK_ROOT,
};
use dicom_deface::reconcile::RotationMode;
use dicom_deface::volume::ExtraDimensions;

/// Default entry point of the external defacing tool.
const DEFAULT_TOOL: &str = "run_CTA-DEFACE.py";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Batch failed: {}", source))]
    Batch {
        #[snafu(source(from(BatchError, Box::new)))]
        source: Box<BatchError>,
    },

    #[snafu(display("{} of {} cases failed", failed, total))]
    CasesFailed { failed: usize, total: usize },
}

#[derive(Parser, Debug)]
#[command(author = "Scott Chase Waggener", version = env!("CARGO_PKG_VERSION"), about = "Deface CT DICOM series by round-tripping them through a volume-based defacing tool", long_about = None)]
struct Args {
    #[arg(help = "Root directory holding one DICOM case, or one case per subdirectory")]
    source: PathBuf,

    #[arg(help = "Output root. Defaced slices mirror the layout of the source root")]
    output: PathBuf,

    #[arg(
        help = "Also keep a copy of each selected volume under this root",
        long = "volume-archive",
        short = 'a'
    )]
    volume_archive: Option<PathBuf>,

    #[arg(
        help = "Root for per-case working directories",
        long = "work-root",
        short = 'w',
        default_value = DEFAULT_WORK_ROOT
    )]
    work_root: PathBuf,

    #[arg(
        help = "Defacing tool to run as `<tool> -i <input dir> -o <output dir> [args...]`",
        long = "tool",
        short = 't',
        default_value = DEFAULT_TOOL
    )]
    tool: PathBuf,

    #[arg(
        help = "Program used to run the tool, e.g. python",
        long = "interpreter"
    )]
    interpreter: Option<PathBuf>,

    #[arg(
        help = "Rotations considered when matching the tool output to the original slices",
        long = "rotation",
        short = 'r',
        value_parser = clap::value_parser!(RotationMode),
        default_value_t = RotationMode::default(),
    )]
    rotation: RotationMode,

    #[arg(
        help = "Series Instance UID to export when a case holds several series",
        long = "series",
        short = 's'
    )]
    series: Option<String>,

    #[arg(
        help = "Keep working directories after each case",
        long = "keep-work",
        default_value_t = false
    )]
    keep_work: bool,

    #[arg(
        help = "Accept 4D tool outputs by keeping the first volume",
        long = "lenient-4d",
        default_value_t = false
    )]
    lenient_4d: bool,

    #[arg(
        help = "Increase logging verbosity (-v for info, -vv for debug)",
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count
    )]
    verbose: u8,

    #[arg(help = "Arguments forwarded verbatim to the tool", last = true)]
    tool_args: Vec<String>,
}

impl Args {
    fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    }
}

fn main() {
    let args = Args::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(args.log_level())
            .finish(),
    )
    .whatever_context("Could not set up global logging subscriber")
    .unwrap_or_else(|e: Whatever| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    run(args).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-1);
    });
}

fn summarize(report: &BatchReport) {
    println!(
        "Processed {} cases: {} succeeded, {} failed",
        report.len(),
        report.succeeded.len(),
        report.failed.len()
    );
    for case in &report.succeeded {
        println!(
            "  ok     {} ({} slices written, {} voxels changed)",
            case.label,
            case.reinject.written,
            case.changed_voxels
                .map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );
    }
    for case in &report.failed {
        println!("  failed {}: {}", case.label, case.error);
    }
}

fn run(args: Args) -> Result<BatchReport, Error> {
    let command = match &args.interpreter {
        Some(interpreter) => ProcessCommand::with_interpreter(interpreter, &args.tool),
        None => ProcessCommand::new(&args.tool),
    };
    let layout = BatchLayout {
        source: args.source,
        output: args.output,
        volume_archive: args.volume_archive,
        work_root: args.work_root,
    };
    let options = PipelineOptions {
        rotation: args.rotation,
        extra_args: args.tool_args,
        keep_work: args.keep_work,
        series: args.series,
        extra_dims: if args.lenient_4d {
            ExtraDimensions::FirstIndex
        } else {
            ExtraDimensions::Reject
        },
        channel_suffix: true,
    };

    let report = run_all_with_progress(&layout, &command, &options).context(BatchSnafu)?;
    summarize(&report);
    if !report.is_success() {
        return CasesFailedSnafu {
            failed: report.failed.len(),
            total: report.len(),
        }
        .fail();
    }
    Ok(report)
}
