#![deny(missing_docs)]

//! dftbstep - DFTB+ calculations driven from Rust
//!
//! dftbstep prepares inputs for the [DFTB+](https://dftbplus.org) program,
//! runs it and digests what it writes. A job is a structure plus a list of
//! steps (choosing parameters, single-point energies, geometry optimizations,
//! band structures and densities of states) that run one after the other,
//! each handing its charges, Hamiltonian and structure to the next.
//!
//! # Overview
//!
//! The reusable core is a pair of transcoders:
//!
//! - [`hsd`] holds nested configuration as an ordered [`hsd::ConfigTree`],
//!   deep-merges trees and emits them as HSD, the structured text DFTB+
//!   reads
//! - [`results`] parses the tagged `results.tag` stream DFTB+ writes into a
//!   typed [`results::ResultMap`], rebuilding multi-dimensional arrays with
//!   [`reshape`]
//!
//! Everything else is built around them: [`calculation`] assembles the input
//! of each step, [`qm_interface`] runs the programs and [`analysis`] derives
//! the reported quantities.
//!
//! # Quick Start
//!
//! ```no_run
//! use dftbstep::calculation::Flowchart;
//! use dftbstep::parser::parse_job;
//! use dftbstep::settings::SettingsManager;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let job = parse_job(Path::new("water.json"))?;
//!     let settings = SettingsManager::load()?.settings().clone();
//!     let report = Flowchart::new(&job.directory, settings).run(&job.structure, &job.steps)?;
//!     for step in &report.steps {
//!         println!("{} {:?}", step.title, step.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`hsd`]: configuration trees, merging and HSD output
//! - [`reshape`]: n-dimensional arrays from flat value streams
//! - [`results`]: the tagged results parser
//! - [`metadata`]: descriptions and units of the known result properties
//! - [`geometry`]: molecular and periodic structures
//! - [`io`]: gen files, data tables, CSV and XYZ output
//! - [`kpoints`]: k-point meshes and band paths
//! - [`slako`]: Slater–Koster parameter sets and spin constants
//! - [`config`]: parameters of each kind of step
//! - [`settings`]: program settings from INI files
//! - [`qm_interface`]: running DFTB+ and its tools
//! - [`analysis`]: post-processing of finished runs
//! - [`calculation`]: step inputs and the flowchart runner
//! - [`parser`]: job files

pub mod analysis;
pub mod calculation;
pub mod config;
pub mod geometry;
pub mod hsd;
pub mod io;
pub mod kpoints;
/// Property descriptions and units
pub mod metadata;
pub mod parser;
pub mod qm_interface;
pub mod reshape;
pub mod results;
/// Configuration management system
pub mod settings;
pub mod slako;

pub use geometry::Structure;
pub use hsd::{ConfigTree, ConfigValue};
pub use results::{ResultMap, ResultValue};
