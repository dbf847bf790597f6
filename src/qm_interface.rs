//! Running DFTB+ and its companion tools.
//!
//! This module is the only place that launches external programs. A
//! calculation goes through the three stages of the [`QMInterface`] trait:
//!
//! - [`QMInterface::write_input`] emits the input tree as `dftb_in.hsd`,
//!   followed by the `Geometry` block of the structure
//! - [`QMInterface::run_calculation`] runs the program in the step directory,
//!   capturing standard output in `DFTB+.out` and standard error in
//!   `stderr.txt`
//! - [`QMInterface::read_output`] parses `results.tag` and, if the program
//!   wrote one, the final geometry `geom.out.gen`
//!
//! The post-processing programs shipped with DFTB+ (`dp_dos`, `dp_bands`)
//! are run through [`CompanionTool`].
//!
//! # Error Handling
//!
//! Every failure is fatal to the step: a program that cannot be started or
//! exits with a non-zero status gives [`QMError::Calculation`] with whatever
//! it printed, and a run that leaves no `results.tag` behind gives
//! [`QMError::MissingOutput`]. Nothing is retried.

use crate::geometry::{GeometryError, Structure};
use crate::hsd::{emit, ConfigTree};
use crate::io::{read_gen, GenStructure, IoError};
use crate::metadata::PropertyTable;
use crate::results::{self, ResultMap, ResultsError};
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

/// Name of the input file DFTB+ reads
pub const INPUT_FILE: &str = "dftb_in.hsd";
/// Name of the tagged results file
pub const RESULTS_FILE: &str = "results.tag";
/// File receiving the standard output of DFTB+
pub const STDOUT_FILE: &str = "DFTB+.out";
/// File receiving the standard error of DFTB+
pub const STDERR_FILE: &str = "stderr.txt";
/// Final geometry of an optimization
pub const GEOMETRY_FILE: &str = "geom.out.gen";

/// Error type for running external programs.
#[derive(Error, Debug)]
pub enum QMError {
    /// File system or I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The program failed
    #[error("{program} failed with status {status:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    Calculation {
        /// The program that was run
        program: String,
        /// Exit code, if the program exited normally
        status: Option<i32>,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },
    /// An expected output file was not written
    #[error("Expected output file {} is missing", .0.display())]
    MissingOutput(PathBuf),
    /// The tagged results could not be parsed
    #[error(transparent)]
    Results(#[from] ResultsError),
    /// An output file was malformed
    #[error(transparent)]
    Format(#[from] IoError),
    /// The structure cannot be written
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Type alias for interface results
type Result<T> = std::result::Result<T, QMError>;

/// What a finished run left behind.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Parsed `results.tag`
    pub results: ResultMap,
    /// The final geometry, if one was written
    pub final_structure: Option<GenStructure>,
}

/// The lifecycle of one calculation of an external program.
pub trait QMInterface {
    /// Writes the input for `structure` into `directory` and returns its path.
    fn write_input(&self, input: &ConfigTree, structure: &Structure, directory: &Path) -> Result<PathBuf>;

    /// Runs the program in `directory` and waits for it.
    fn run_calculation(&self, directory: &Path) -> Result<()>;

    /// Reads the results of a finished run in `directory`.
    fn read_output(&self, directory: &Path) -> Result<RunOutput>;
}

/// The DFTB+ executable.
#[derive(Debug, Clone)]
pub struct DftbPlusInterface {
    command: String,
    threads: usize,
    properties: PropertyTable,
}

impl DftbPlusInterface {
    /// An interface running `command` on one thread.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            threads: 1,
            properties: PropertyTable::standard().clone(),
        }
    }

    /// Sets `OMP_NUM_THREADS` for the run.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Uses a different property table when reading results.
    pub fn with_properties(mut self, properties: PropertyTable) -> Self {
        self.properties = properties;
        self
    }

    /// The complete text of `dftb_in.hsd`.
    pub fn input_text(input: &ConfigTree, structure: &Structure) -> Result<String> {
        let mut text = emit(input);
        text.push_str(&structure.geometry_hsd()?);
        Ok(text)
    }
}

impl QMInterface for DftbPlusInterface {
    fn write_input(&self, input: &ConfigTree, structure: &Structure, directory: &Path) -> Result<PathBuf> {
        fs::create_dir_all(directory)?;
        let text = Self::input_text(input, structure)?;
        debug!("{}:\n{}", INPUT_FILE, text);
        let path = directory.join(INPUT_FILE);
        fs::write(&path, text)?;
        Ok(path)
    }

    fn run_calculation(&self, directory: &Path) -> Result<()> {
        info!(
            "Running {} in {} with {} thread(s)",
            self.command,
            directory.display(),
            self.threads
        );
        let stdout = fs::File::create(directory.join(STDOUT_FILE))?;
        let stderr = fs::File::create(directory.join(STDERR_FILE))?;
        let status = Command::new(&self.command)
            .current_dir(directory)
            .env("OMP_NUM_THREADS", self.threads.to_string())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()?;

        if !status.success() {
            let read = |name: &str| fs::read_to_string(directory.join(name)).unwrap_or_default();
            return Err(QMError::Calculation {
                program: self.command.clone(),
                status: status.code(),
                stdout: read(STDOUT_FILE),
                stderr: read(STDERR_FILE),
            });
        }
        Ok(())
    }

    fn read_output(&self, directory: &Path) -> Result<RunOutput> {
        let path = directory.join(RESULTS_FILE);
        if !path.exists() {
            return Err(QMError::MissingOutput(path));
        }
        let text = fs::read_to_string(&path)?;
        let results = results::parse(&text, &self.properties)?;

        let gen_path = directory.join(GEOMETRY_FILE);
        let final_structure = if gen_path.exists() {
            Some(read_gen(&gen_path)?)
        } else {
            None
        };
        Ok(RunOutput {
            results,
            final_structure,
        })
    }
}

/// A post-processing program such as `dp_dos` or `dp_bands`.
#[derive(Debug, Clone)]
pub struct CompanionTool {
    command: String,
}

impl CompanionTool {
    /// A tool run as `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Runs the tool with `args` in `directory` and returns its standard
    /// output.
    pub fn run(&self, args: &[&str], directory: &Path) -> Result<String> {
        info!("Running {} {} in {}", self.command, args.join(" "), directory.display());
        let output = Command::new(&self.command)
            .args(args)
            .current_dir(directory)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            return Err(QMError::Calculation {
                program: self.command.clone(),
                status: output.status.code(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(stdout)
    }
}
