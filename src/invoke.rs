//! Running the external voxel-modification tool.
//!
//! The tool's exit status is advisory. Some tools crash during post-processing after the
//! useful volume has been written, so the invocation only fails when the output
//! directory holds no volume files afterwards.
use snafu::{ResultExt, Snafu};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::file::{DirectoryOperations, NiftiFileOperations};

/// Environment forcing the tool onto the CPU.
pub const CPU_ONLY_ENV: (&str, &str) = ("CUDA_VISIBLE_DEVICES", "");

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum InvokeError {
    #[snafu(display("Failed to prepare output directory {}: {}", path.display(), source))]
    PrepareOutput {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("Failed to run {}: {}", program, source))]
    Spawn {
        program: String,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display("Failed to list output directory {}: {}", path.display(), source))]
    ListOutput {
        path: PathBuf,
        #[snafu(source(from(std::io::Error, Box::new)))]
        source: Box<std::io::Error>,
    },

    #[snafu(display(
        "No volume files produced in {} (exit code {:?})",
        output_dir.display(),
        exit_code
    ))]
    NoOutputProduced {
        output_dir: PathBuf,
        exit_code: Option<i32>,
    },
}

/// A process that can be run with extra arguments and environment.
/// Returns the exit code, or `None` if the process was terminated by a signal.
pub trait ExternalCommand {
    fn run(&self, args: &[OsString], env: &[(String, String)]) -> std::io::Result<Option<i32>>;

    fn describe(&self) -> String {
        "external command".to_string()
    }
}

impl<F> ExternalCommand for F
where
    F: Fn(&[OsString], &[(String, String)]) -> std::io::Result<Option<i32>>,
{
    fn run(&self, args: &[OsString], env: &[(String, String)]) -> std::io::Result<Option<i32>> {
        self(args, env)
    }
}

/// A program on disk, optionally run through an interpreter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub leading_args: Vec<OsString>,
}

impl ProcessCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Run `script` through `interpreter`, e.g. a Python entry point.
    pub fn with_interpreter<P: Into<PathBuf>, S: Into<OsString>>(interpreter: P, script: S) -> Self {
        Self {
            program: interpreter.into(),
            leading_args: vec![script.into()],
        }
    }
}

impl ExternalCommand for ProcessCommand {
    fn run(&self, args: &[OsString], env: &[(String, String)]) -> std::io::Result<Option<i32>> {
        let status = Command::new(&self.program)
            .args(&self.leading_args)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()?;
        Ok(status.code())
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.leading_args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of one tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub exit_code: Option<i32>,
    pub outputs: Vec<PathBuf>,
}

pub struct ToolInvoker<'a> {
    command: &'a dyn ExternalCommand,
}

impl<'a> ToolInvoker<'a> {
    pub fn new(command: &'a dyn ExternalCommand) -> Self {
        Self { command }
    }

    /// Arguments passed to the tool: input and output directories, then `extra_args` verbatim.
    pub fn arguments(input_dir: &Path, output_dir: &Path, extra_args: &[String]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            input_dir.as_os_str().to_owned(),
            "-o".into(),
            output_dir.as_os_str().to_owned(),
        ];
        args.extend(extra_args.iter().map(OsString::from));
        args
    }

    /// Run the tool on `input_dir`, writing into a freshly emptied `output_dir`.
    pub fn invoke<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        input_dir: P,
        output_dir: Q,
        extra_args: &[String],
    ) -> Result<Invocation, InvokeError> {
        let input_dir = input_dir.as_ref();
        let output_dir = output_dir.as_ref();
        output_dir
            .recreate_dir()
            .context(PrepareOutputSnafu { path: output_dir })?;

        let args = Self::arguments(input_dir, output_dir, extra_args);
        let env = vec![(CPU_ONLY_ENV.0.to_string(), CPU_ONLY_ENV.1.to_string())];
        info!(
            "Running {} on {} -> {}",
            self.command.describe(),
            input_dir.display(),
            output_dir.display()
        );
        let exit_code = self.command.run(&args, &env).context(SpawnSnafu {
            program: self.command.describe(),
        })?;
        if exit_code != Some(0) {
            warn!(
                "{} exited with code {:?}, inspecting its output anyway",
                self.command.describe(),
                exit_code
            );
        }

        let outputs = output_dir
            .find_niftis()
            .context(ListOutputSnafu { path: output_dir })?;
        if outputs.is_empty() {
            return NoOutputProducedSnafu {
                output_dir,
                exit_code,
            }
            .fail();
        }
        info!("Tool produced {} volume files", outputs.len());
        Ok(Invocation { exit_code, outputs })
    }
}
