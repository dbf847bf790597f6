//! Program settings for dftbstep.
//!
//! Settings that do not belong in a job file (where the executables live,
//! where the Slater–Koster data is, how many cores to use) are read from INI
//! files with the following precedence:
//!
//! 1. Local configuration (`./dftbstep.ini`)
//! 2. User configuration (`~/.config/dftbstep/dftbstep.ini`)
//! 3. System configuration (`/etc/dftbstep/dftbstep.ini`)
//! 4. Built-in defaults
//!
//! A value set in a higher-priority file overrides the same value from a
//! lower-priority one; values a file does not mention are left alone.
//!
//! # Configuration File Format
//!
//! ```ini
//! [executables]
//! dftbplus = dftb+
//! dp_dos = dp_dos
//! dp_bands = dp_bands
//!
//! [general]
//! slako_dir = /opt/dftb/slako
//! ncores = available
//! use_openmp = true
//! natoms_per_core = 500
//!
//! [logging]
//! level = info
//! ```

use configparser::ini::Ini;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "dftbstep.ini";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

type Section = HashMap<String, Option<String>>;

/// All program settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Locations of the DFTB+ executables
    pub executables: ExecutableSettings,
    /// Data locations and parallelism
    pub general: GeneralSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Names or paths of the programs that are run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableSettings {
    /// The DFTB+ executable (default: "dftb+")
    pub dftbplus: String,
    /// The DOS post-processing tool (default: "dp_dos")
    pub dp_dos: String,
    /// The band structure post-processing tool (default: "dp_bands")
    pub dp_bands: String,
}

impl Default for ExecutableSettings {
    fn default() -> Self {
        Self {
            dftbplus: "dftb+".to_string(),
            dp_dos: "dp_dos".to_string(),
            dp_bands: "dp_bands".to_string(),
        }
    }
}

/// Number of cores available to a calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreCount {
    /// Whatever the machine reports
    Available,
    /// A fixed number
    Fixed(usize),
}

impl CoreCount {
    /// Resolves the count to a concrete number of cores.
    pub fn resolve(self) -> usize {
        match self {
            CoreCount::Available => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            CoreCount::Fixed(n) => n.max(1),
        }
    }
}

/// Data locations and parallelism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralSettings {
    /// Directory holding the Slater–Koster datasets and their metadata
    pub slako_dir: PathBuf,
    /// Metadata file, relative to `slako_dir` unless absolute
    pub metadata_file: PathBuf,
    /// Spin constants file, relative to `slako_dir` unless absolute
    pub spin_constants_file: PathBuf,
    /// Cores that may be used (default: available)
    pub ncores: CoreCount,
    /// Run DFTB+ with OpenMP threads (default: true)
    pub use_openmp: bool,
    /// Atoms per thread when sizing the OpenMP team (default: 500)
    pub natoms_per_core: usize,
    /// Largest structure whose per-atom table is printed (default: 25)
    pub max_atoms_to_print: usize,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            slako_dir: PathBuf::from("slako"),
            metadata_file: PathBuf::from("metadata.json"),
            spin_constants_file: PathBuf::from("spin_constants.json"),
            ncores: CoreCount::Available,
            use_openmp: true,
            natoms_per_core: 500,
            max_atoms_to_print: 25,
        }
    }
}

impl GeneralSettings {
    /// Full path of the Slater–Koster metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        self.slako_dir.join(&self.metadata_file)
    }

    /// Full path of the spin constants file.
    pub fn spin_constants_path(&self) -> PathBuf {
        self.slako_dir.join(&self.spin_constants_file)
    }

    /// OpenMP thread count for a structure with `n_atoms` atoms.
    ///
    /// `round(n_atoms / natoms_per_core)` clamped to `1..=ncores`, or 1 when
    /// OpenMP is disabled.
    pub fn openmp_threads(&self, n_atoms: usize) -> usize {
        if !self.use_openmp {
            return 1;
        }
        let per_core = self.natoms_per_core.max(1) as f64;
        let wanted = (n_atoms as f64 / per_core).round() as usize;
        wanted.clamp(1, self.ncores.resolve())
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (default: "info")
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingSettings {
    /// The level as a `log` filter, if it names one.
    pub fn level_filter(&self) -> Option<log::LevelFilter> {
        self.level.trim().parse().ok()
    }
}

/// Loads and holds the program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
}

impl SettingsManager {
    /// Loads settings from the system, user and local files, in that order.
    ///
    /// A file that exists but cannot be parsed is skipped with a warning.
    pub fn load() -> Result<Self, ConfigError> {
        let (settings, source) = Self::load_from_files()?;
        info!("Configuration loaded from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
        })
    }

    /// Loads settings from a single file layered over the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        Self::apply_file(&mut settings, path)?;
        Ok(Self {
            settings,
            config_source: path.display().to_string(),
        })
    }

    /// Wraps already-built settings.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            config_source: "in-memory settings".to_string(),
        }
    }

    /// Where the settings came from.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// The loaded settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the executable settings.
    pub fn executables(&self) -> &ExecutableSettings {
        &self.settings.executables
    }

    /// Gets the general settings.
    pub fn general(&self) -> &GeneralSettings {
        &self.settings.general
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    fn load_from_files() -> Result<(Settings, String), ConfigError> {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();

        let candidates = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from(CONFIG_FILE_NAME))),
        ];

        for (label, path) in candidates {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            match Self::apply_file(&mut settings, &path) {
                Ok(()) => {
                    config_source = format!("{} config ({})", label, path.display());
                    debug!("Loaded {} configuration from: {}", label, path.display());
                }
                Err(e) => {
                    warn!(
                        "Failed to load {} config from {}: {}",
                        label,
                        path.display(),
                        e
                    );
                }
            }
        }

        Ok((settings, config_source))
    }

    /// Applies the values found in one INI file on top of `settings`.
    fn apply_file(settings: &mut Settings, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::apply_str(settings, &content)
    }

    fn apply_str(settings: &mut Settings, content: &str) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        ini.read(content.to_string())
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;

        // Parse into a copy so a bad value leaves the caller's settings alone.
        let mut updated = settings.clone();
        let map = ini.get_map_ref();
        if let Some(section) = map.get("executables") {
            Self::parse_executables(&mut updated.executables, section);
        }
        if let Some(section) = map.get("general") {
            Self::parse_general(&mut updated.general, section)?;
        }
        if let Some(section) = map.get("logging") {
            Self::parse_logging(&mut updated.logging, section);
        }
        *settings = updated;
        Ok(())
    }

    fn parse_executables(executables: &mut ExecutableSettings, section: &Section) {
        if let Some(Some(value)) = section.get("dftbplus") {
            executables.dftbplus = value.clone();
        }
        if let Some(Some(value)) = section.get("dp_dos") {
            executables.dp_dos = value.clone();
        }
        if let Some(Some(value)) = section.get("dp_bands") {
            executables.dp_bands = value.clone();
        }
    }

    fn parse_general(general: &mut GeneralSettings, section: &Section) -> Result<(), ConfigError> {
        if let Some(Some(value)) = section.get("slako_dir") {
            general.slako_dir = PathBuf::from(value);
        }
        if let Some(Some(value)) = section.get("metadata_file") {
            general.metadata_file = PathBuf::from(value);
        }
        if let Some(Some(value)) = section.get("spin_constants_file") {
            general.spin_constants_file = PathBuf::from(value);
        }
        if let Some(Some(value)) = section.get("ncores") {
            general.ncores = if value.trim().eq_ignore_ascii_case("available") {
                CoreCount::Available
            } else {
                CoreCount::Fixed(value.trim().parse().map_err(|_| {
                    ConfigError::InvalidValue(format!("Invalid ncores: {}", value))
                })?)
            };
        }
        if let Some(Some(value)) = section.get("use_openmp") {
            general.use_openmp = parse_bool(value).ok_or_else(|| {
                ConfigError::InvalidValue(format!("Invalid use_openmp value: {}", value))
            })?;
        }
        if let Some(Some(value)) = section.get("natoms_per_core") {
            general.natoms_per_core = value.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!("Invalid natoms_per_core: {}", value))
            })?;
        }
        if let Some(Some(value)) = section.get("max_atoms_to_print") {
            general.max_atoms_to_print = value.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!("Invalid max_atoms_to_print: {}", value))
            })?;
        }
        Ok(())
    }

    fn parse_logging(logging: &mut LoggingSettings, section: &Section) {
        if let Some(Some(level)) = section.get("level") {
            logging.level = level.clone();
        }
    }

    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/dftbstep").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("dftbstep").join(CONFIG_FILE_NAME))
        }
    }

    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("dftbstep")
                    .join(CONFIG_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("dftbstep").join(CONFIG_FILE_NAME))
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl SettingsManager {
    /// Writes a commented settings file holding every option at its default.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let executables = ExecutableSettings::default();
        let general = GeneralSettings::default();
        let logging = LoggingSettings::default();
        format!(
            r#"# dftbstep configuration file
#
# Files are read in this order, later ones overriding earlier ones:
#
# 1. System config (/etc/dftbstep/dftbstep.ini)
# 2. User config (~/.config/dftbstep/dftbstep.ini)
# 3. Current working directory (./dftbstep.ini)
#
# Anything not set here keeps the built-in default shown below.

[executables]
# The DFTB+ program
dftbplus = {}

# Post-processing tools shipped with DFTB+
dp_dos = {}
dp_bands = {}

[general]
# Directory with the Slater-Koster parameter sets
slako_dir = {}

# Dataset metadata and atomic spin constants, relative to slako_dir
metadata_file = {}
spin_constants_file = {}

# Number of cores to use: "available" or a number
ncores = available

# Use OpenMP threads, one per natoms_per_core atoms
use_openmp = {}
natoms_per_core = {}

# Per-atom results are printed only for structures up to this size
max_atoms_to_print = {}

[logging]
# Log level: error, warn, info, debug, trace
level = {}
"#,
            executables.dftbplus,
            executables.dp_dos,
            executables.dp_bands,
            general.slako_dir.display(),
            general.metadata_file.display(),
            general.spin_constants_file.display(),
            general.use_openmp,
            general.natoms_per_core,
            general.max_atoms_to_print,
            logging.level,
        )
    }
}
