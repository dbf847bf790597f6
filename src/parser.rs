//! Reading job files.
//!
//! A job is a JSON document naming the structure and the steps to apply to
//! it:
//!
//! ```text
//! {
//!     "directory": "water",
//!     "structure": {"file": "water.xyz", "charge": 0, "multiplicity": 1},
//!     "steps": [
//!         {"kind": "choose_parameters", "dataset": "3ob"},
//!         {"kind": "optimization", "method": {"algorithm": "LBFGS"}},
//!         {"kind": "energy", "initial_charges": "from previous step"}
//!     ]
//! }
//! ```
//!
//! The structure is either given inline, with the fields of
//! [`Structure`], or read from a file. Files ending in `.gen` are read as
//! DFTB+ gen files and anything else as XYZ. An extended XYZ comment line
//! carrying `Lattice="..."` makes the structure periodic. Relative paths are
//! taken relative to the job file.
//!
//! Without a `directory` the steps run in a directory named after the job
//! file, next to it.
//!
//! # Examples
//!
//! ```no_run
//! use dftbstep::parser::parse_job;
//! use std::path::Path;
//!
//! let job = parse_job(Path::new("water.json"))?;
//! println!("{} steps on {} atoms", job.steps.len(), job.structure.n_atoms());
//! # Ok::<(), dftbstep::parser::ParseError>(())
//! ```

use crate::config::StepKind;
use crate::geometry::Structure;
use crate::io::{read_gen, IoError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for parsing operations.
#[derive(Error, Debug)]
pub enum ParseError {
    /// I/O error when reading files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The job file is not valid JSON or has unknown values
    #[error("Invalid job file: {0}")]
    Json(#[from] serde_json::Error),
    /// A structure file could not be read
    #[error(transparent)]
    Format(#[from] IoError),
    /// Parse error with descriptive message
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Type alias for parse operation results
type Result<T> = std::result::Result<T, ParseError>;

lazy_static! {
    static ref LATTICE: Regex = Regex::new(r#"(?i)lattice\s*=\s*"([^"]*)""#).unwrap();
}

/// A parsed job, ready to be handed to a
/// [`Flowchart`](crate::calculation::Flowchart).
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// The starting structure
    pub structure: Structure,
    /// The steps, in order
    pub steps: Vec<StepKind>,
    /// Root of the step directories
    pub directory: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StructureEntry {
    File {
        file: PathBuf,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        charge: i64,
        #[serde(default = "default_multiplicity")]
        multiplicity: u32,
    },
    Inline(Structure),
}

fn default_multiplicity() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    structure: StructureEntry,
    steps: Vec<StepKind>,
    #[serde(default)]
    directory: Option<PathBuf>,
}

/// Parses a job file.
pub fn parse_job(path: &Path) -> Result<Job> {
    let text = fs::read_to_string(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "job".to_string());
    parse_job_str(&text, base, &base.join(stem))
}

/// Parses the text of a job file. Relative paths are resolved against
/// `base`; `default_directory` is used when the job names none.
pub fn parse_job_str(text: &str, base: &Path, default_directory: &Path) -> Result<Job> {
    let job: JobFile = serde_json::from_str(text)?;
    if job.steps.is_empty() {
        return Err(ParseError::Parse("The job has no steps".into()));
    }

    let structure = match job.structure {
        StructureEntry::Inline(structure) => structure,
        StructureEntry::File {
            file,
            name,
            charge,
            multiplicity,
        } => {
            let mut structure = read_structure(&base.join(&file))?;
            structure.charge = charge;
            structure.multiplicity = multiplicity;
            if name.is_some() {
                structure.name = name;
            }
            structure
        }
    };
    structure
        .validate()
        .map_err(|e| ParseError::Parse(e.to_string()))?;

    let directory = match job.directory {
        Some(directory) => base.join(directory),
        None => default_directory.to_path_buf(),
    };
    Ok(Job {
        structure,
        steps: job.steps,
        directory,
    })
}

/// Reads a structure from a `.gen` or XYZ file.
pub fn read_structure(path: &Path) -> Result<Structure> {
    let is_gen = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gen"));
    let mut structure = if is_gen {
        let template = Structure::molecule(Vec::new(), Vec::new());
        read_gen(path)?.to_structure(&template)
    } else {
        parse_xyz(&fs::read_to_string(path)?)?
    };
    if structure.name.is_none() {
        structure.name = path.file_stem().map(|s| s.to_string_lossy().to_string());
    }
    Ok(structure)
}

/// Parses XYZ text, including the lattice of extended XYZ.
pub fn parse_xyz(text: &str) -> Result<Structure> {
    let mut lines = text.lines();
    let count: usize = lines
        .next()
        .map(str::trim)
        .and_then(|line| line.parse().ok())
        .ok_or_else(|| ParseError::Parse("The first line of an XYZ file must be the atom count".into()))?;
    let comment = lines.next().unwrap_or("").trim();

    let mut elements = Vec::with_capacity(count);
    let mut coordinates = Vec::with_capacity(count);
    for line in lines.filter(|l| !l.trim().is_empty()).take(count) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(ParseError::Parse(format!("Invalid atom line '{}'", line)));
        }
        let mut xyz = [0.0; 3];
        for (value, field) in xyz.iter_mut().zip(&parts[1..4]) {
            *value = field
                .parse()
                .map_err(|_| ParseError::Parse("Invalid coordinate in XYZ file".into()))?;
        }
        elements.push(parts[0].to_string());
        coordinates.push(xyz);
    }
    if elements.len() != count {
        return Err(ParseError::Parse(format!(
            "Expected {} atoms in XYZ file, found {}",
            count,
            elements.len()
        )));
    }

    let lattice = LATTICE.captures(comment).map(|c| c[1].to_string());
    let structure = match lattice {
        Some(values) => {
            let numbers = values
                .split_whitespace()
                .map(|v| v.parse::<f64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|_| ParseError::Parse(format!("Invalid lattice '{}'", values)))?;
            if numbers.len() != 9 {
                return Err(ParseError::Parse(format!(
                    "The lattice needs nine numbers, got {}",
                    numbers.len()
                )));
            }
            let mut rows = [[0.0; 3]; 3];
            for (i, value) in numbers.into_iter().enumerate() {
                rows[i / 3][i % 3] = value;
            }
            Structure::periodic(elements, coordinates, rows)
        }
        None => {
            let mut structure = Structure::molecule(elements, coordinates);
            if !comment.is_empty() {
                structure.name = Some(comment.to_string());
            }
            structure
        }
    };
    Ok(structure)
}

/// A starting job file for the structure in `structure_file`.
///
/// Molecules get parameters, an optimization and a final energy; periodic
/// systems also get a DOS. The band structure needs a path through the
/// Brillouin zone and is left out.
pub fn job_template(structure_file: &Path, structure: &Structure) -> String {
    let mut steps = vec![
        json!({"kind": "choose_parameters", "dataset": "3ob", "subset": "none"}),
        json!({"kind": "optimization", "method": {"algorithm": "Rational Function"}}),
        json!({"kind": "energy", "initial_charges": "from previous step"}),
    ];
    if structure.periodicity() == 3 {
        steps.push(json!({"kind": "dos"}));
    }
    let job = json!({
        "structure": {
            "file": structure_file.display().to_string(),
            "charge": structure.charge,
            "multiplicity": structure.multiplicity,
        },
        "steps": steps,
    });
    serde_json::to_string_pretty(&job).unwrap_or_default()
}
