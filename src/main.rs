//! dftbstep command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the steps of a job file
//! dftbstep run water.json
//!
//! # Convert a results.tag file to JSON
//! dftbstep parse results.tag
//!
//! # Write a JSON input tree as HSD
//! dftbstep hsd input.json
//!
//! # Create a job file for a structure, or a settings template
//! dftbstep ci water.xyz
//! dftbstep ci dftbstep.ini
//! ```
//!
//! Logging goes to standard output. `RUST_LOG` takes precedence over the
//! `[logging] level` setting.

use dftbstep::calculation::{Flowchart, StepStatus};
use dftbstep::hsd::{emit, ConfigTree};
use dftbstep::metadata::PropertyTable;
use dftbstep::parser::{job_template, parse_job, read_structure};
use dftbstep::results;
use dftbstep::settings::{Settings, SettingsManager};
use log::{info, warn};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

const SETTINGS_FILE: &str = "dftbstep.ini";

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }
    if args[1] == "--help" || args[1] == "-h" {
        print_help(&args[0]);
        process::exit(0);
    }

    let settings_manager = SettingsManager::load();
    let level = settings_manager
        .as_ref()
        .ok()
        .and_then(|m| m.logging().level_filter())
        .unwrap_or(log::LevelFilter::Info);
    let mut builder = env_logger::Builder::from_default_env();
    if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(level);
    }
    builder
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();

    let settings = match settings_manager {
        Ok(manager) => {
            info!("Configuration loaded from: {}", manager.config_source());
            manager.settings().clone()
        }
        Err(e) => {
            warn!("Could not load settings, using defaults: {}", e);
            Settings::default()
        }
    };

    let Some(file_arg) = args.get(2) else {
        eprintln!("Error: Missing file argument");
        print_usage(&args[0]);
        process::exit(1);
    };
    let path = Path::new(file_arg);

    let outcome = match args[1].as_str() {
        "run" => run_job(path, settings),
        "parse" => run_parse(path),
        "hsd" => run_hsd(path),
        "ci" => run_create(path),
        command => {
            eprintln!("Error: Unknown command: {}", command);
            print_usage(&args[0]);
            process::exit(1);
        }
    };
    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn print_usage(program_name: &str) {
    eprintln!("dftbstep - DFTB+ calculations driven by job files");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} run <job.json>", program_name);
    eprintln!("                    Run the steps of a job file");
    eprintln!("  {} parse <results.tag>", program_name);
    eprintln!("                    Print the results as JSON");
    eprintln!("  {} hsd <input.json>", program_name);
    eprintln!("                    Print a JSON input tree as HSD");
    eprintln!("  {} ci <structure_file>", program_name);
    eprintln!("                    Create a job file for a .xyz or .gen structure");
    eprintln!("  {} ci {}", program_name, SETTINGS_FILE);
    eprintln!("                    Create a settings template");
    eprintln!("  {} --help", program_name);
}

fn print_help(program_name: &str) {
    print_usage(program_name);
    eprintln!();
    eprintln!("Job files:");
    eprintln!("  A JSON object with \"structure\" (inline, or {{\"file\": ...}}), \"steps\"");
    eprintln!("  and an optional \"directory\". Step kinds: choose_parameters, energy,");
    eprintln!("  optimization, band_structure, dos. Each step runs in <directory>/<n>;");
    eprintln!("  a step whose directory holds success.dat is not run again.");
    eprintln!();
    eprintln!("Settings are read from /etc/dftbstep/{0}, ~/.config/dftbstep/{0}", SETTINGS_FILE);
    eprintln!("and ./{}, later files overriding earlier ones.", SETTINGS_FILE);
}

fn run_job(path: &Path, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    println!("**** dftbstep {} ****\n", env!("CARGO_PKG_VERSION"));
    let job = parse_job(path)?;
    info!(
        "{} atoms, {} steps, running in {}",
        job.structure.n_atoms(),
        job.steps.len(),
        job.directory.display()
    );
    fs::create_dir_all(&job.directory)?;

    let report = Flowchart::new(&job.directory, settings).run(&job.structure, &job.steps)?;

    let mut all_results = serde_json::Map::new();
    for step in &report.steps {
        let status = match step.status {
            StepStatus::Completed => "completed",
            StepStatus::Restarted => "reused",
            StepStatus::InputOnly => "input written",
            StepStatus::Skipped => "skipped",
            StepStatus::Configured => "configured",
        };
        println!("Step {:>2}  {:<20} {}", step.number, step.title, status);
        if let Some(results) = &step.results {
            all_results.insert(step.number.to_string(), serde_json::to_value(results)?);
        }
    }
    let results_path = job.directory.join("results.json");
    fs::write(&results_path, serde_json::to_string_pretty(&all_results)?)?;
    info!("Results written to {}", results_path.display());
    Ok(())
}

fn run_parse(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)?;
    let results = results::parse(&text, PropertyTable::standard())?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn run_hsd(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let tree: ConfigTree = serde_json::from_str(&fs::read_to_string(path)?)?;
    print!("{}", emit(&tree));
    Ok(())
}

fn run_create(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if path.file_name().is_some_and(|name| name == SETTINGS_FILE) {
        if path.exists() {
            return Err(format!(
                "{} already exists. Please remove it first or choose a different location.",
                path.display()
            )
            .into());
        }
        SettingsManager::create_template(path)?;
        println!("✓ Settings template created: {}", path.display());
        return Ok(());
    }

    let structure = read_structure(path)?;
    let output: PathBuf = path.with_extension("json");
    if output.exists() {
        return Err(format!("{} already exists", output.display()).into());
    }
    let file_name = path.file_name().map(PathBuf::from).unwrap_or_else(|| path.to_path_buf());
    fs::write(&output, job_template(&file_name, &structure))?;
    println!("✓ Job file created: {}", output.display());
    println!("  Run it with: dftbstep run {}", output.display());
    Ok(())
}
