use clap::{Parser, Subcommand};
use snafu::{Report, ResultExt, Snafu, Whatever};
use std::path::PathBuf;
use tracing::{error, info, Level};

use dicom_deface::catalog::{CatalogError, SeriesCatalog};
use dicom_deface::errors::NiftiError;
use dicom_deface::export::{ExportError, Exporter};
use dicom_deface::reconcile::{ReconcileError, Reconciler, RotationMode};
use dicom_deface::reinject::{reinject_reconciled, ReinjectError};
use dicom_deface::volume::{ExtraDimensions, Volume};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to catalog {}: {}", path.display(), source))]
    Catalog {
        path: PathBuf,
        #[snafu(source(from(CatalogError, Box::new)))]
        source: Box<CatalogError>,
    },

    #[snafu(display("Failed to export: {}", source))]
    Export {
        #[snafu(source(from(ExportError, Box::new)))]
        source: Box<ExportError>,
    },

    #[snafu(display("Failed to load volume: {}", source))]
    LoadVolume {
        #[snafu(source(from(NiftiError, Box::new)))]
        source: Box<NiftiError>,
    },

    #[snafu(display("Failed to match volume: {}", source))]
    Reconcile {
        #[snafu(source(from(ReconcileError, Box::new)))]
        source: Box<ReconcileError>,
    },

    #[snafu(display("Failed to write slices: {}", source))]
    Reinject {
        #[snafu(source(from(ReinjectError, Box::new)))]
        source: Box<ReinjectError>,
    },
}

#[derive(Parser, Debug)]
#[command(author = "Scott Chase Waggener", version = env!("CARGO_PKG_VERSION"), about = "Convert a DICOM series to a volume, or write a volume back into its DICOM series", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(
        help = "Increase logging verbosity",
        short = 'v',
        long = "verbose",
        global = true,
        default_value_t = false
    )]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export one series of a DICOM directory as a volume
    Dicom2nii {
        #[arg(help = "Directory of DICOM slices")]
        source: PathBuf,

        #[arg(help = "Directory to write the volume into")]
        output: PathBuf,

        #[arg(help = "Series Instance UID to export", long = "series", short = 's')]
        series: Option<String>,

        #[arg(
            help = "Do not append the channel suffix to the file name",
            long = "no-channel-suffix",
            default_value_t = false
        )]
        no_channel_suffix: bool,
    },

    /// Write a volume into copies of the DICOM series it was made from
    Nii2dicom {
        #[arg(help = "Volume file")]
        volume: PathBuf,

        #[arg(help = "Directory holding the original DICOM series")]
        reference: PathBuf,

        #[arg(help = "Directory to write the DICOM slices into")]
        output: PathBuf,

        #[arg(
            help = "Rotations considered when matching the volume to the original slices",
            long = "rotation",
            short = 'r',
            value_parser = clap::value_parser!(RotationMode),
            default_value_t = RotationMode::default(),
        )]
        rotation: RotationMode,

        #[arg(
            help = "Accept 4D volumes by keeping the first volume",
            long = "lenient-4d",
            default_value_t = false
        )]
        lenient_4d: bool,
    },
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose { Level::INFO } else { Level::WARN };

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
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

fn run(args: Args) -> Result<(), Error> {
    match args.command {
        Command::Dicom2nii {
            source,
            output,
            series,
            no_channel_suffix,
        } => {
            let catalog = SeriesCatalog::discover(&source).context(CatalogSnafu { path: &source })?;
            let exporter = Exporter {
                channel_suffix: !no_channel_suffix,
            };
            let export = exporter
                .export(&catalog, series.as_deref(), &output)
                .context(ExportSnafu)?;
            println!("{}", export.path.display());
        }
        Command::Nii2dicom {
            volume,
            reference,
            output,
            rotation,
            lenient_4d,
        } => {
            let extra = if lenient_4d {
                ExtraDimensions::FirstIndex
            } else {
                ExtraDimensions::Reject
            };
            let volume = Volume::open_with(&volume, extra).context(LoadVolumeSnafu)?;
            let catalog =
                SeriesCatalog::discover(&reference).context(CatalogSnafu { path: &reference })?;
            let reconciliation = Reconciler::new(rotation)
                .reconcile(&volume, &catalog)
                .context(ReconcileSnafu)?;
            let report =
                reinject_reconciled(&reconciliation, &volume, &output).context(ReinjectSnafu)?;
            info!("Restore report: {:?}", report.restore);
            println!("Wrote {} slices to {}", report.written, output.display());
        }
    }
    Ok(())
}
