//! Building and running the steps of a flowchart.
//!
//! A flowchart is an ordered list of [`StepKind`]s applied to one structure.
//! `Choose Parameters` contributes the Slater–Koster files (or the xTB
//! method) to an input tree shared by every later step. Each runnable step
//! builds its own input from its parameters and from what earlier steps left
//! behind, merges it over a copy of the shared tree and runs DFTB+ in its own
//! numbered directory below the root.
//!
//! The band structure and DOS steps reuse the Hamiltonian and the converged
//! charges of the most recent energy or optimization step, so they must come
//! after one.
//!
//! # Restarting
//!
//! A step directory containing `success.dat` is not run again: its input is
//! neither written nor executed, but the results it left are read and
//! analysed as if it had just finished. Deleting `success.dat` forces a
//! rerun.

use crate::analysis::{
    self, add_energy_properties, add_optimization_properties, atom_properties,
    parse_detailed_output, AnalysisError, DetailedOutput, Summary,
};
use crate::config::{
    BandStructureParams, DosParams, EnergyParams, Filling, HCorrection, InitialCharges,
    OptimizationMethod, OptimizationParams, SpinPolarisation, StepKind, ThirdOrder,
    HARTREE_TO_EV,
};
use crate::geometry::{GeometryError, Structure};
use crate::hsd::{deep_merge, ConfigTree, ConfigValue};
use crate::io::write_xyz;
use crate::kpoints::{KPointError, Klines, SupercellFolding};
use crate::qm_interface::{CompanionTool, DftbPlusInterface, QMError, QMInterface, RunOutput};
use crate::results::{ResultMap, ResultValue};
use crate::settings::Settings;
use crate::slako::{choose_parameters, ModelKind, ParameterChoice, SlakoError, SlakoMetadata, SpinConstants};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker file of a finished step
pub const SUCCESS_FILE: &str = "success.dat";
/// Charges written by DFTB+ when `WriteChargesAsText` is set
pub const CHARGES_FILE: &str = "charges.dat";
/// Summary of an SCC run written by DFTB+
pub const DETAILED_FILE: &str = "detailed.out";
/// Per-atom charges and spins written after an energy step
pub const ATOM_PROPERTIES_FILE: &str = "atom_properties.csv";
/// The final structure of an optimization
pub const OPTIMIZED_FILE: &str = "optimized.xyz";

/// Errors raised while preparing, running or analysing a step.
#[derive(Error, Debug)]
pub enum StepError {
    /// File system or I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// DFTB+ could not be run or its output read
    #[error(transparent)]
    Qm(#[from] QMError),
    /// The parameters could not be chosen
    #[error(transparent)]
    Slako(#[from] SlakoError),
    /// Post-processing failed
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    /// The k-points could not be generated
    #[error(transparent)]
    KPoints(#[from] KPointError),
    /// The structure is invalid
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// The flowchart has no atoms to work on
    #[error("There is no structure to calculate")]
    NoStructure,
    /// A step needs results of an earlier step that is not there
    #[error("{0}")]
    MissingPreviousStep(String),
    /// A combination of options DFTB+ cannot handle
    #[error("{0}")]
    Unsupported(String),
}

/// Type alias for step results
pub type Result<T> = std::result::Result<T, StepError>;

/// What the band structure and DOS steps take over from the last energy or
/// optimization step.
#[derive(Debug, Clone, PartialEq)]
pub struct PreviousEnergyStep {
    /// Directory the step ran in
    pub directory: PathBuf,
    /// The `Hamiltonian` block of its own input
    pub hamiltonian: ConfigTree,
    /// The `Analysis` block of its own input
    pub analysis: Option<ConfigTree>,
    /// Fermi level in hartree
    pub fermi_level: Option<f64>,
    /// Whether the run was spin polarised
    pub spin_polarized: bool,
}

impl PreviousEnergyStep {
    /// The charges the step wrote, if the file exists.
    pub fn charges(&self) -> Option<PathBuf> {
        let path = self.directory.join(CHARGES_FILE);
        path.exists().then_some(path)
    }
}

/// Everything an input builder may look at.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// The current structure
    pub structure: &'a Structure,
    /// The chosen parameters, if `Choose Parameters` ran
    pub parameters: Option<&'a ParameterChoice>,
    /// The last energy or optimization step
    pub previous_energy: Option<&'a PreviousEnergyStep>,
    /// Spin constants, needed for spin-polarised runs
    pub spin_constants: Option<&'a SpinConstants>,
}

impl<'a> StepContext<'a> {
    fn parameters(&self) -> Result<&'a ParameterChoice> {
        self.parameters.ok_or_else(|| {
            StepError::MissingPreviousStep(
                "A Choose Parameters step must come before any calculation".to_string(),
            )
        })
    }

    fn previous_energy(&self, title: &str) -> Result<&'a PreviousEnergyStep> {
        self.previous_energy.ok_or_else(|| {
            StepError::MissingPreviousStep(format!(
                "The {} step needs an earlier Energy or Optimization step",
                title
            ))
        })
    }
}

/// A step input ready to be merged over the shared input.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStep {
    /// The step's own input tree
    pub input: ConfigTree,
    /// Charges to copy into the step directory before running
    pub charges_from: Option<PathBuf>,
    /// The band path, for band structure steps
    pub klines: Option<Klines>,
}

impl PreparedStep {
    fn new(input: ConfigTree) -> Self {
        Self {
            input,
            charges_from: None,
            klines: None,
        }
    }
}

/// The outcome of building a step's input.
#[derive(Debug, Clone, PartialEq)]
pub enum StepInput {
    /// Nothing to run, with the reason
    Skip(String),
    /// Run DFTB+ with this input
    Run(PreparedStep),
}

/// Builds the input of a runnable step.
pub fn build_input(step: &StepKind, context: &StepContext) -> Result<StepInput> {
    match step {
        StepKind::ChooseParameters(_) => Err(StepError::Unsupported(
            "Choose Parameters does not run DFTB+".to_string(),
        )),
        StepKind::Energy(params) => energy_input(params, context).map(StepInput::Run),
        StepKind::Optimization(params) => optimization_input(params, context).map(StepInput::Run),
        StepKind::BandStructure(params) => band_structure_input(params, context),
        StepKind::Dos(params) => dos_input(params, context),
    }
}

fn braced_list(values: &[f64]) -> String {
    let items: Vec<String> = values.iter().map(|v| format!("{:?}", v)).collect();
    format!("{{{}}}", items.join(", "))
}

fn nested(key: &str, value: impl Into<ConfigValue>) -> ConfigTree {
    let mut tree = ConfigTree::new();
    tree.insert(key, value);
    tree
}

/// Input of a single-point energy.
///
/// Sets up SCC and filling, third-order terms and the H correction from the
/// options or the defaults of the chosen parameters, initial charges and
/// spins, and the k-point mesh for periodic systems.
pub fn energy_input(params: &EnergyParams, context: &StepContext) -> Result<PreparedStep> {
    let choice = context.parameters()?;
    let structure = context.structure;
    let mut prepared = PreparedStep::new(ConfigTree::new());
    prepared.input.tree_mut("Analysis").insert("PrintForces", true);

    let mut reading_charges = false;
    {
        let hamiltonian = prepared
            .input
            .tree_mut("Hamiltonian")
            .tree_mut(choice.kind.hamiltonian_key());
        hamiltonian.insert("SCC", params.scc);
        if params.scc {
            hamiltonian.insert("SCCTolerance", params.scc_tolerance);
            hamiltonian.insert("MaxSCCIterations", params.max_scc_iterations);
            hamiltonian.insert("ConvergentSccOnly", false);

            let (name, order) = match params.filling {
                Filling::Fermi => ("Filling = Fermi", None),
                Filling::Gaussian => ("Filling = MethfesselPaxton", Some(1)),
                Filling::MethfesselPaxton => ("Filling = MethfesselPaxton", Some(2)),
            };
            let mut filling = ConfigTree::new();
            if let Some(order) = order {
                filling.insert("Order", order);
            }
            filling.insert("Temperature [K]", params.filling_temperature);
            hamiltonian.insert(name, filling);

            if choice.kind == ModelKind::Dftb {
                third_order_input(params, choice, hamiltonian)?;
                h_correction_input(params, choice, hamiltonian);
            }
        }

        let previous_charges = context.previous_energy.and_then(PreviousEnergyStep::charges);
        let structure_charges = || structure.charges_summing_to_total();
        match params.initial_charges {
            InitialCharges::Default => {
                if let Some(path) = previous_charges {
                    prepared.charges_from = Some(path);
                } else if let Some(charges) = structure_charges() {
                    hamiltonian.insert("InitialCharges", nested("AllAtomCharges", braced_list(&charges)));
                }
            }
            InitialCharges::FromPreviousStep => {
                let path = previous_charges.ok_or_else(|| {
                    StepError::MissingPreviousStep(
                        "Initial charges from the previous step were requested, but there are none"
                            .to_string(),
                    )
                })?;
                prepared.charges_from = Some(path);
            }
            InitialCharges::FromStructure => {
                if let Some(charges) = structure_charges() {
                    hamiltonian.insert("InitialCharges", nested("AllAtomCharges", braced_list(&charges)));
                } else {
                    warn!("The structure has no atomic charges to start from");
                }
            }
            InitialCharges::None => {}
        }
        if prepared.charges_from.is_some() {
            hamiltonian.insert("ReadInitialCharges", true);
            reading_charges = true;
        }
        hamiltonian.insert("Charge", structure.charge);

        if params.scc {
            spin_input(params, context, choice, reading_charges, hamiltonian)?;
        }

        if structure.periodicity() == 3 {
            let mesh = SupercellFolding::for_structure(structure, &params.k_grid)?;
            info!("Using {}", mesh.describe());
            hamiltonian.insert("KPointsAndWeights", mesh.to_hsd_value());
        }
    }

    if reading_charges {
        let options = prepared.input.tree_mut("Options");
        options.insert("ReadChargesAsText", true);
        options.insert("SkipChargeTest", true);
    }
    if params.write_eigenvectors {
        let options = prepared.input.tree_mut("Options");
        options.insert("WriteDetailedXml", true);
        options.insert("WriteEigenvectors", true);
    }
    Ok(prepared)
}

fn third_order_input(params: &EnergyParams, choice: &ParameterChoice, hamiltonian: &mut ConfigTree) -> Result<()> {
    let third_order = match params.third_order {
        ThirdOrder::DefaultForParameters => match choice.defaults.third_order.as_deref() {
            Some(value) => ThirdOrder::from_default(value).ok_or_else(|| {
                StepError::Unsupported(format!("Don't recognize ThirdOrder = '{}'", value))
            })?,
            None => ThirdOrder::No,
        },
        other => other,
    };
    match third_order {
        ThirdOrder::Full => {
            hamiltonian.insert("ThirdOrderFull", true);
        }
        ThirdOrder::Partial => {
            hamiltonian.insert("ThirdOrder", true);
        }
        ThirdOrder::No | ThirdOrder::DefaultForParameters => {
            hamiltonian.insert("ThirdOrder", false);
        }
    }
    Ok(())
}

fn h_correction_input(params: &EnergyParams, choice: &ParameterChoice, hamiltonian: &mut ConfigTree) {
    let method = match params.h_correction {
        HCorrection::None => None,
        HCorrection::Damping => Some(("Damping".to_string(), params.damping_exponent)),
        HCorrection::Dftb3D3H5 => Some(("DFTB3-D3H5".to_string(), params.damping_exponent)),
        HCorrection::DefaultForParameters => choice
            .defaults
            .h_correction
            .as_ref()
            .filter(|d| d.value != "None")
            .map(|d| (d.value.clone(), d.damping_exponent.unwrap_or(params.damping_exponent))),
    };
    match method {
        Some((method, exponent)) => {
            let mut block = ConfigTree::new();
            if method == "Damping" {
                block.insert("Exponent", exponent);
            }
            hamiltonian.insert("HCorrection", nested(&method, block));
        }
        None => {
            hamiltonian.insert("HCorrection", "None {}");
        }
    }
}

fn spin_input(
    params: &EnergyParams,
    context: &StepContext,
    choice: &ParameterChoice,
    reading_charges: bool,
    hamiltonian: &mut ConfigTree,
) -> Result<()> {
    let structure = context.structure;
    let spins = structure
        .atom_spins
        .as_ref()
        .filter(|s| params.use_atom_spins && s.len() == structure.n_atoms());
    let polarised = match params.spin_polarisation {
        SpinPolarisation::None => false,
        SpinPolarisation::FromSystem => {
            structure.multiplicity != 1 || (structure.periodicity() != 0 && spins.is_some())
        }
        SpinPolarisation::Collinear | SpinPolarisation::NonCollinear => true,
    };
    if !polarised {
        hamiltonian.insert("SpinPolarisation", ConfigTree::new());
        return Ok(());
    }

    let mut section = ConfigTree::new();
    let name = if params.spin_polarisation == SpinPolarisation::NonCollinear {
        "NonColinear"
    } else {
        "Colinear"
    };
    if !reading_charges {
        match spins {
            Some(spins) if name == "Colinear" => {
                section.insert("InitialSpins", nested("AllAtomSpins", braced_list(spins)));
            }
            _ => {
                section.insert("UnpairedElectrons", structure.multiplicity.saturating_sub(1));
            }
        }
    }
    section.insert("RelaxTotalSpin", params.relax_total_spin);
    hamiltonian.insert("SpinPolarisation", nested(name, section));

    let constants = context.spin_constants.ok_or_else(|| {
        StepError::MissingPreviousStep("Spin constants are needed for a spin-polarised calculation".to_string())
    })?;
    let elements = structure.type_names();
    hamiltonian.insert(
        "SpinConstants",
        constants.to_input(&choice.model, &elements, params.shell_resolved_spin)?,
    );
    Ok(())
}

/// Input of a geometry optimization: the energy input plus the driver.
pub fn optimization_input(params: &OptimizationParams, context: &StepContext) -> Result<PreparedStep> {
    let mut prepared = energy_input(&params.energy, context)?;

    let (name, optimizer) = match &params.method {
        OptimizationMethod::RationalFunction { diag_limit } => {
            ("Optimizer = Rational", nested("DiagLimit", *diag_limit))
        }
        OptimizationMethod::Lbfgs { memory } => ("Optimizer = LBFGS", nested("Memory", *memory)),
        OptimizationMethod::Fire {
            step_size,
            n_min,
            a_par,
            f_inc,
            f_dec,
            f_alpha,
        } => {
            let mut block = ConfigTree::new();
            block.insert("StepSize", *step_size);
            block.insert("nMin", *n_min);
            block.insert("aPar", *a_par);
            block.insert("fInc", *f_inc);
            block.insert("fDec", *f_dec);
            block.insert("fAlpha", *f_alpha);
            ("Optimizer = FIRE", block)
        }
    };

    let mut driver = ConfigTree::new();
    driver.insert(name, optimizer);
    driver.insert("Convergence", nested("GradAMax", params.max_force_component));
    driver.insert("MaxSteps", params.max_steps);
    if context.structure.periodicity() == 3 {
        driver.insert("LatticeOpt", params.lattice_opt);
    }
    driver.insert("OutputPrefix", "geom.out");
    prepared.input.insert("Driver = GeometryOptimization", driver);
    Ok(prepared)
}

fn model_block(hamiltonian: &mut ConfigTree) -> Option<&mut ConfigTree> {
    let key = ["DFTB", "xTB"]
        .into_iter()
        .find(|key| hamiltonian.get_tree(key).is_some())?;
    hamiltonian.get_tree_mut(key)
}

/// The previous Hamiltonian set up for a non-SCC pass on converged charges.
fn restarted_hamiltonian(previous: &PreviousEnergyStep, title: &str) -> Result<(ConfigTree, PathBuf)> {
    let charges = previous.charges().ok_or_else(|| {
        StepError::MissingPreviousStep(format!(
            "The {} step needs the charges of the previous step in {}",
            title,
            previous.directory.display()
        ))
    })?;
    let mut hamiltonian = previous.hamiltonian.clone();
    let block = model_block(&mut hamiltonian).ok_or_else(|| {
        StepError::MissingPreviousStep(format!("The {} step found no Hamiltonian to reuse", title))
    })?;
    block.insert("MaxSCCIterations", 1u32);
    block.insert("ReadInitialCharges", true);
    block.remove("InitialCharges");
    Ok((hamiltonian, charges))
}

/// Input of a band structure along the requested path.
///
/// Periodic systems only; molecules are skipped.
pub fn band_structure_input(params: &BandStructureParams, context: &StepContext) -> Result<StepInput> {
    if context.structure.periodicity() != 3 {
        return Ok(StepInput::Skip(
            "The system is not periodic, so the band structure will not be calculated.".to_string(),
        ));
    }
    let path = params.path.as_ref().ok_or_else(|| {
        StepError::Unsupported("The band structure needs a path through the Brillouin zone".to_string())
    })?;
    let previous = context.previous_energy("Band Structure")?;
    let (mut hamiltonian, charges) = restarted_hamiltonian(previous, "Band Structure")?;

    let reciprocal = context.structure.reciprocal_lattice()?;
    let klines = Klines::generate(path, &reciprocal, params.n_points)?;
    debug!("{} points along the band path", klines.n_points());
    if let Some(block) = model_block(&mut hamiltonian) {
        block.insert("KPointsAndWeights", klines.to_hsd_value());
    }

    let mut input = ConfigTree::new();
    input.insert("Options", nested("ReadChargesAsText", true));
    input.insert("Hamiltonian", hamiltonian);
    Ok(StepInput::Run(PreparedStep {
        input,
        charges_from: Some(charges),
        klines: Some(klines),
    }))
}

/// Input of a density of states on a dense k-point mesh, projected onto the
/// shells of each element.
pub fn dos_input(params: &DosParams, context: &StepContext) -> Result<StepInput> {
    let structure = context.structure;
    if structure.periodicity() != 3 {
        return Ok(StepInput::Skip(
            "The system is not periodic, so the DOS will not be calculated.".to_string(),
        ));
    }
    let previous = context.previous_energy("DOS")?;
    if previous.fermi_level.is_none() {
        return Err(StepError::MissingPreviousStep(
            "The DOS needs the Fermi level of the previous step".to_string(),
        ));
    }
    let (mut hamiltonian, charges) = restarted_hamiltonian(previous, "DOS")?;
    let mesh = SupercellFolding::for_structure(structure, &params.k_grid)?;
    info!("DOS using {}", mesh.describe());
    if let Some(block) = model_block(&mut hamiltonian) {
        block.insert("SCCTolerance", 10.0);
        block.insert("KPointsAndWeights", mesh.to_hsd_value());
    }

    let mut analysis = previous.analysis.clone().unwrap_or_default();
    analysis.insert("CalculateForces", false);
    let projections = analysis.tree_mut("ProjectStates");
    for element in structure.type_names() {
        let mut region = ConfigTree::new();
        region.insert("Atoms", element);
        region.insert("ShellResolved", true);
        region.insert("Label", format!("\"pdos_{}\"", element));
        let name = format!("Region<{}>", projections.len() + 1);
        projections.insert(&name, region);
    }

    let mut input = ConfigTree::new();
    let options = input.tree_mut("Options");
    options.insert("ReadChargesAsText", true);
    options.insert("SkipChargeTest", true);
    input.insert("Hamiltonian", hamiltonian);
    input.insert("Analysis", analysis);
    Ok(StepInput::Run(PreparedStep {
        input,
        charges_from: Some(charges),
        klines: None,
    }))
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Ran and was analysed
    Completed,
    /// Already finished in an earlier run; only analysed
    Restarted,
    /// Input written, DFTB+ not run
    InputOnly,
    /// Not applicable to the structure
    Skipped,
    /// Contributed input only
    Configured,
}

/// The result of one step of the flowchart.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// 1-based position in the flowchart
    pub number: usize,
    /// Display name
    pub title: &'static str,
    /// Directory the step ran in, for runnable steps
    pub directory: Option<PathBuf>,
    /// How the step ended
    pub status: StepStatus,
    /// Parsed and derived results
    pub results: Option<ResultMap>,
    /// Table of the headline numbers
    pub summary: Summary,
}

/// Everything a flowchart produced.
#[derive(Debug, Clone)]
pub struct FlowchartReport {
    /// One entry per step
    pub steps: Vec<StepOutcome>,
    /// The structure after the last step
    pub structure: Structure,
}

struct RunState {
    structure: Structure,
    shared: ConfigTree,
    choice: Option<ParameterChoice>,
    previous_energy: Option<PreviousEnergyStep>,
}

/// The base of every DFTB+ input.
pub fn base_input() -> ConfigTree {
    let mut input = ConfigTree::new();
    let options = input.tree_mut("Options");
    options.insert("WriteResultsTag", true);
    options.insert("WriteChargesAsText", true);
    input
}

/// Runs a sequence of steps below a root directory.
#[derive(Debug, Clone)]
pub struct Flowchart {
    root: PathBuf,
    settings: Settings,
    metadata: Option<SlakoMetadata>,
    spin_constants: Option<SpinConstants>,
}

impl Flowchart {
    /// A flowchart writing its step directories below `root`.
    pub fn new(root: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            root: root.into(),
            settings,
            metadata: None,
            spin_constants: None,
        }
    }

    /// Uses `metadata` instead of reading the metadata file.
    pub fn with_metadata(mut self, metadata: SlakoMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Uses `constants` instead of reading the spin constants file.
    pub fn with_spin_constants(mut self, constants: SpinConstants) -> Self {
        self.spin_constants = Some(constants);
        self
    }

    /// Runs `steps` on `structure`.
    pub fn run(&self, structure: &Structure, steps: &[StepKind]) -> Result<FlowchartReport> {
        if structure.n_atoms() == 0 {
            return Err(StepError::NoStructure);
        }
        structure.validate()?;

        let mut metadata = self.metadata.clone();
        let spin_constants = match &self.spin_constants {
            Some(constants) => Some(constants.clone()),
            None => {
                let path = self.settings.general.spin_constants_path();
                if path.exists() {
                    Some(SpinConstants::from_file(&path)?)
                } else {
                    debug!("No spin constants at {}", path.display());
                    None
                }
            }
        };

        let mut state = RunState {
            structure: structure.clone(),
            shared: base_input(),
            choice: None,
            previous_energy: None,
        };
        let mut outcomes = Vec::with_capacity(steps.len());

        for (i, step) in steps.iter().enumerate() {
            let number = i + 1;
            info!("Step {}: {}", number, step.title());
            if let StepKind::ChooseParameters(params) = step {
                if metadata.is_none() {
                    metadata = Some(SlakoMetadata::from_file(&self.settings.general.metadata_path())?);
                }
                let Some(metadata) = metadata.as_ref() else {
                    continue;
                };
                let elements = state.structure.type_names();
                let subset = Some(params.subset.as_str());
                let choice = choose_parameters(
                    metadata,
                    &params.dataset,
                    subset,
                    &elements,
                    &self.settings.general.slako_dir,
                )?;
                info!("Using parameters {}", choice.model);
                deep_merge(&mut state.shared, &choice.input);
                state.choice = Some(choice);
                outcomes.push(StepOutcome {
                    number,
                    title: step.title(),
                    directory: None,
                    status: StepStatus::Configured,
                    results: None,
                    summary: Summary::default(),
                });
                continue;
            }

            let outcome = self.run_step(number, step, &mut state, spin_constants.as_ref())?;
            if !outcome.summary.rows.is_empty() {
                info!("\n{}", outcome.summary);
            }
            outcomes.push(outcome);
        }

        Ok(FlowchartReport {
            steps: outcomes,
            structure: state.structure,
        })
    }

    fn run_step(
        &self,
        number: usize,
        step: &StepKind,
        state: &mut RunState,
        spin_constants: Option<&SpinConstants>,
    ) -> Result<StepOutcome> {
        let directory = self.root.join(number.to_string());
        let mut outcome = StepOutcome {
            number,
            title: step.title(),
            directory: Some(directory.clone()),
            status: StepStatus::Completed,
            results: None,
            summary: Summary::default(),
        };

        let context = StepContext {
            structure: &state.structure,
            parameters: state.choice.as_ref(),
            previous_energy: state.previous_energy.as_ref(),
            spin_constants,
        };
        let prepared = match build_input(step, &context)? {
            StepInput::Skip(reason) => {
                info!("{}", reason);
                outcome.status = StepStatus::Skipped;
                return Ok(outcome);
            }
            StepInput::Run(prepared) => prepared,
        };

        let mut input = state.shared.clone();
        deep_merge(&mut input, &prepared.input);

        let threads = self.settings.general.openmp_threads(state.structure.n_atoms());
        let interface = DftbPlusInterface::new(&self.settings.executables.dftbplus).with_threads(threads);

        if directory.join(SUCCESS_FILE).exists() {
            info!("Step {} already finished; reusing its results", number);
            outcome.status = StepStatus::Restarted;
        } else {
            interface.write_input(&input, &state.structure, &directory)?;
            if let Some(source) = &prepared.charges_from {
                fs::copy(source, directory.join(CHARGES_FILE))?;
            }
            let input_only = step.energy_params().map_or(false, |p| p.input_only);
            if input_only {
                info!("Wrote the input in {}", directory.display());
                outcome.status = StepStatus::InputOnly;
                return Ok(outcome);
            }
            interface.run_calculation(&directory)?;
        }

        let RunOutput {
            mut results,
            final_structure,
        } = interface.read_output(&directory)?;
        if let Some(choice) = &state.choice {
            results.insert("model", ResultValue::Text(choice.model.clone()));
        }

        let detailed = read_detailed(&directory)?;
        outcome.summary = match step {
            StepKind::Energy(_) => {
                let summary = self.analyze_energy(&directory, &mut results, state, &detailed)?;
                state.previous_energy = Some(snapshot(&directory, &prepared.input, &results));
                summary
            }
            StepKind::Optimization(params) => {
                let mut displacements = (None, None);
                if let Some(parsed) = final_structure {
                    let optimized = parsed.to_structure(&state.structure);
                    write_xyz(&optimized, &directory.join(OPTIMIZED_FILE)).map_err(QMError::from)?;
                    if optimized.periodicity() == 0 {
                        displacements = (
                            optimized.displacement_from(&state.structure, false),
                            optimized.displacement_from(&state.structure, true),
                        );
                    }
                    if params.update_structure {
                        state.structure = optimized;
                    }
                }
                let mut summary = self.analyze_energy(&directory, &mut results, state, &detailed)?;
                add_optimization_properties(&mut results, &mut summary, &detailed, displacements);
                state.previous_energy = Some(snapshot(&directory, &prepared.input, &results));
                summary
            }
            StepKind::BandStructure(_) => self.analyze_bands(&directory, &prepared, state)?,
            StepKind::Dos(_) => self.analyze_dos(&directory, state)?,
            StepKind::ChooseParameters(_) => Summary::default(),
        };

        fs::write(directory.join(SUCCESS_FILE), "success")?;
        outcome.results = Some(results);
        Ok(outcome)
    }

    fn analyze_energy(
        &self,
        directory: &Path,
        results: &mut ResultMap,
        state: &mut RunState,
        detailed: &DetailedOutput,
    ) -> Result<Summary> {
        let references = state.choice.as_ref().and_then(|c| c.reference_energies.as_ref());
        let summary = add_energy_properties(results, &state.structure, references, detailed);

        if let Some(properties) = atom_properties(results, state.structure.n_atoms()) {
            let table = properties.write(
                &state.structure,
                &directory.join(ATOM_PROPERTIES_FILE),
                self.settings.general.max_atoms_to_print,
            )?;
            if let Some(table) = table {
                info!("Atomic charges and spins:\n{}", table);
            }
            properties.apply_to(&mut state.structure);
        }
        Ok(summary)
    }

    fn previous_fermi_ev(&self, state: &RunState) -> Option<(f64, bool)> {
        state
            .previous_energy
            .as_ref()
            .and_then(|p| p.fermi_level.map(|e| (e * HARTREE_TO_EV, p.spin_polarized)))
    }

    fn analyze_bands(&self, directory: &Path, prepared: &PreparedStep, state: &RunState) -> Result<Summary> {
        let (fermi_ev, spin_polarized) = match self.previous_fermi_ev(state) {
            Some(fermi) => fermi,
            None => {
                warn!("No Fermi level from the previous step; bands are not shifted");
                (0.0, state.previous_energy.as_ref().map_or(false, |p| p.spin_polarized))
            }
        };
        let (labels, points) = prepared
            .klines
            .as_ref()
            .map(|k| (k.labels.clone(), k.distances.clone()))
            .unwrap_or_default();
        let tool = CompanionTool::new(&self.settings.executables.dp_bands);
        let table = analysis::run_bands(directory, &tool, fermi_ev, spin_polarized, &labels, &points)?;

        let mut summary = Summary::default();
        summary.push("k-points", table.bands.index.len().to_string(), "");
        summary.push("Bands", table.bands.columns.len().to_string(), "");
        Ok(summary)
    }

    fn analyze_dos(&self, directory: &Path, state: &RunState) -> Result<Summary> {
        let (fermi_ev, spin_polarized) = self.previous_fermi_ev(state).ok_or_else(|| {
            StepError::MissingPreviousStep("The DOS needs the Fermi level of the previous step".to_string())
        })?;
        let tool = CompanionTool::new(&self.settings.executables.dp_dos);
        let dos = analysis::run_dos(directory, &tool, fermi_ev, spin_polarized)?;

        let mut summary = Summary::default();
        summary.push("Energies", dos.index.len().to_string(), "");
        summary.push("Fermi energy", format!("{:.2}", fermi_ev), "eV");
        Ok(summary)
    }
}

fn read_detailed(directory: &Path) -> Result<DetailedOutput> {
    let path = directory.join(DETAILED_FILE);
    if !path.exists() {
        return Ok(DetailedOutput::default());
    }
    Ok(parse_detailed_output(&fs::read_to_string(path)?))
}

fn snapshot(directory: &Path, input: &ConfigTree, results: &ResultMap) -> PreviousEnergyStep {
    PreviousEnergyStep {
        directory: directory.to_path_buf(),
        hamiltonian: input.get_tree("Hamiltonian").cloned().unwrap_or_default(),
        analysis: input.get_tree("Analysis").cloned(),
        fermi_level: results.get_real("fermi_level"),
        spin_polarized: matches!(results.get("spin polarized"), Some(ResultValue::Flag(true))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChooseParametersParams;
    use crate::hsd::{emit, Scalar};
    use crate::kpoints::{BandPath, KGrid};
    use crate::slako::HamiltonianDefaults;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn is_yes(tree: &ConfigTree, key: &str) -> bool {
        matches!(tree.get(key), Some(ConfigValue::Scalar(Scalar::Bool(true))))
    }

    fn dftb_choice() -> ParameterChoice {
        let mut input = ConfigTree::new();
        input
            .tree_mut("Hamiltonian")
            .tree_mut("DFTB")
            .insert("SlaterKosterFiles", ConfigTree::new());
        ParameterChoice {
            input,
            model: "DFTB/3ob".to_string(),
            kind: ModelKind::Dftb,
            defaults: HamiltonianDefaults::default(),
            reference_energies: None,
        }
    }

    const WATER_METADATA: &str = r#"{
        "DFTB": {
            "potentials": {
                "hh": {"filename": "3ob/H-H.skf"},
                "ho": {"filename": "3ob/H-O.skf"},
                "oh": {"filename": "3ob/O-H.skf"},
                "oo": {"filename": "3ob/O-O.skf"}
            },
            "datasets": {
                "DFTB - 3ob": {
                    "potential pairs": {
                        "H-H": {"md5sum": "hh"},
                        "H-O": {"md5sum": "ho"},
                        "O-H": {"md5sum": "oh"},
                        "O-O": {"md5sum": "oo"}
                    },
                    "element data": {
                        "H": {"maximum angular momentum": "s"},
                        "O": {"maximum angular momentum": "p"}
                    }
                }
            }
        }
    }"#;

    fn water() -> Structure {
        Structure::molecule(
            vec!["O".into(), "H".into(), "H".into()],
            vec![[0.0, 0.0, 0.0], [0.0, 0.757, 0.587], [0.0, -0.757, 0.587]],
        )
    }

    fn silicon() -> Structure {
        Structure::from_fractional(
            vec!["Si".into(), "Si".into()],
            &[[0.0, 0.0, 0.0], [0.25, 0.25, 0.25]],
            [[0.0, 2.715, 2.715], [2.715, 0.0, 2.715], [2.715, 2.715, 0.0]],
        )
    }

    fn context<'a>(structure: &'a Structure, choice: &'a ParameterChoice) -> StepContext<'a> {
        StepContext {
            structure,
            parameters: Some(choice),
            previous_energy: None,
            spin_constants: None,
        }
    }

    fn dftb(prepared: &PreparedStep) -> &ConfigTree {
        prepared
            .input
            .get_tree("Hamiltonian")
            .and_then(|h| h.get_tree("DFTB"))
            .unwrap()
    }

    #[test]
    fn test_energy_input_for_molecule() {
        let structure = water();
        let choice = dftb_choice();
        let prepared = energy_input(&EnergyParams::default(), &context(&structure, &choice)).unwrap();
        let hamiltonian = dftb(&prepared);

        assert!(is_yes(hamiltonian, "SCC"));
        assert!(hamiltonian.contains_key("Filling = Fermi"));
        assert!(!is_yes(hamiltonian, "ThirdOrder"));
        assert_eq!(
            hamiltonian.get("HCorrection"),
            Some(&ConfigValue::from("None {}"))
        );
        assert!(!hamiltonian.contains_key("KPointsAndWeights"));
        assert!(hamiltonian.get_tree("SpinPolarisation").unwrap().is_empty());
        assert!(is_yes(prepared.input.get_tree("Analysis").unwrap(), "PrintForces"));
        assert!(prepared.charges_from.is_none());
    }

    #[test]
    fn test_energy_input_without_parameters_fails() {
        let structure = water();
        let context = StepContext {
            structure: &structure,
            parameters: None,
            previous_energy: None,
            spin_constants: None,
        };
        assert!(matches!(
            energy_input(&EnergyParams::default(), &context),
            Err(StepError::MissingPreviousStep(_))
        ));
    }

    #[test]
    fn test_dataset_defaults_for_third_order_and_damping() {
        let structure = water();
        let mut choice = dftb_choice();
        choice.defaults = serde_json::from_str(
            r#"{"ThirdOrder": "Full", "HCorrection": {"value": "Damping", "Damping Exponent": 4.0}}"#,
        )
        .unwrap();
        let params = EnergyParams {
            third_order: ThirdOrder::DefaultForParameters,
            h_correction: HCorrection::DefaultForParameters,
            ..EnergyParams::default()
        };
        let prepared = energy_input(&params, &context(&structure, &choice)).unwrap();
        let text = emit(&prepared.input);
        assert!(text.contains("ThirdOrderFull = Yes"));
        assert!(text.contains("Damping {\n                Exponent = 4.0\n"));
    }

    #[test]
    fn test_structure_charges_are_shifted_to_total() {
        let mut structure = water();
        structure.charge = 3;
        structure.atom_charges = Some(vec![-1.0, 0.5, 0.5]);
        let choice = dftb_choice();
        let prepared = energy_input(&EnergyParams::default(), &context(&structure, &choice)).unwrap();
        let charges = dftb(&prepared).get_tree("InitialCharges").unwrap();
        assert_eq!(
            charges.get("AllAtomCharges"),
            Some(&ConfigValue::from("{0.0, 1.5, 1.5}"))
        );
    }

    #[test]
    fn test_previous_charges_are_read() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(CHARGES_FILE), "charges").unwrap();
        let previous = PreviousEnergyStep {
            directory: temp.path().to_path_buf(),
            hamiltonian: ConfigTree::new(),
            analysis: None,
            fermi_level: None,
            spin_polarized: false,
        };
        let structure = water();
        let choice = dftb_choice();
        let mut context = context(&structure, &choice);
        context.previous_energy = Some(&previous);

        let prepared = energy_input(&EnergyParams::default(), &context).unwrap();
        assert_eq!(prepared.charges_from, Some(temp.path().join(CHARGES_FILE)));
        assert!(is_yes(dftb(&prepared), "ReadInitialCharges"));
        let options = prepared.input.get_tree("Options").unwrap();
        assert!(is_yes(options, "ReadChargesAsText"));
        assert!(is_yes(options, "SkipChargeTest"));
    }

    #[test]
    fn test_charges_from_previous_step_are_required() {
        let structure = water();
        let choice = dftb_choice();
        let params = EnergyParams {
            initial_charges: InitialCharges::FromPreviousStep,
            ..EnergyParams::default()
        };
        assert!(matches!(
            energy_input(&params, &context(&structure, &choice)),
            Err(StepError::MissingPreviousStep(_))
        ));
    }

    fn triplet_spin_constants(params: &EnergyParams) -> ConfigTree {
        let mut structure = water();
        structure.multiplicity = 3;
        let choice = dftb_choice();
        let constants = SpinConstants::from_json(
            r#"{"GGA": {"H": [-0.072], "O": [-0.035, -0.030, -0.030, -0.028]}}"#,
        )
        .unwrap();
        let mut context = context(&structure, &choice);
        context.spin_constants = Some(&constants);

        let prepared = energy_input(params, &context).unwrap();
        let hamiltonian = dftb(&prepared);
        let colinear = hamiltonian
            .get_tree("SpinPolarisation")
            .and_then(|s| s.get_tree("Colinear"))
            .unwrap();
        assert_eq!(colinear.get("UnpairedElectrons"), Some(&ConfigValue::from(2u32)));
        hamiltonian.get_tree("SpinConstants").unwrap().clone()
    }

    #[test]
    fn test_triplet_is_spin_polarised_shell_resolved() {
        let constants = triplet_spin_constants(&EnergyParams::default());
        assert!(is_yes(&constants, "ShellResolvedSpin"));
        assert_eq!(
            constants.get("O"),
            Some(&ConfigValue::from("{-0.035 -0.03 -0.03 -0.028}"))
        );
        assert_eq!(constants.get("H"), Some(&ConfigValue::from("{-0.072}")));
    }

    #[test]
    fn test_triplet_is_spin_polarised_per_valence_shell() {
        let params = EnergyParams {
            shell_resolved_spin: false,
            ..EnergyParams::default()
        };
        let constants = triplet_spin_constants(&params);
        assert_eq!(
            constants.get("ShellResolvedSpin"),
            Some(&ConfigValue::Scalar(Scalar::Bool(false)))
        );
        assert_eq!(constants.get("O"), Some(&ConfigValue::from(-0.028)));
        assert_eq!(constants.get("H"), Some(&ConfigValue::from(-0.072)));
        assert!(emit(&constants).contains("ShellResolvedSpin = No\n"));
    }

    #[test]
    fn test_spin_polarised_without_constants_fails() {
        let mut structure = water();
        structure.multiplicity = 2;
        let choice = dftb_choice();
        assert!(energy_input(&EnergyParams::default(), &context(&structure, &choice)).is_err());
    }

    #[test]
    fn test_periodic_energy_has_k_points() {
        let structure = silicon();
        let choice = dftb_choice();
        let params = EnergyParams {
            k_grid: KGrid::SupercellFolding { na: 4, nb: 4, nc: 4 },
            ..EnergyParams::default()
        };
        let prepared = energy_input(&params, &context(&structure, &choice)).unwrap();
        let text = emit(&prepared.input);
        assert!(text.contains("KPointsAndWeights = SupercellFolding {\n            4 0 0\n"));
    }

    #[test]
    fn test_optimization_driver() {
        let structure = water();
        let choice = dftb_choice();
        let prepared = optimization_input(&OptimizationParams::default(), &context(&structure, &choice)).unwrap();
        let driver = prepared.input.get_tree("Driver = GeometryOptimization").unwrap();
        assert!(driver.contains_key("Optimizer = Rational"));
        assert_eq!(driver.get("MaxSteps"), Some(&ConfigValue::from(200u32)));
        assert!(!driver.contains_key("LatticeOpt"));
        assert_eq!(driver.get("OutputPrefix"), Some(&ConfigValue::from("geom.out")));
        let convergence = driver.get_tree("Convergence").unwrap();
        assert_eq!(convergence.get("GradAMax"), Some(&ConfigValue::from(1e-4)));
    }

    fn previous_step(directory: &Path) -> PreviousEnergyStep {
        fs::write(directory.join(CHARGES_FILE), "charges").unwrap();
        let mut hamiltonian = ConfigTree::new();
        let block = hamiltonian.tree_mut("DFTB");
        block.insert("SCC", true);
        block.insert("MaxSCCIterations", 100u32);
        block.insert("InitialCharges", nested("AllAtomCharges", "{0.0, 0.0}"));
        PreviousEnergyStep {
            directory: directory.to_path_buf(),
            hamiltonian,
            analysis: Some(nested("PrintForces", true)),
            fermi_level: Some(-0.2),
            spin_polarized: false,
        }
    }

    #[test]
    fn test_dos_input_reuses_previous_hamiltonian() {
        let temp = TempDir::new().unwrap();
        let previous = previous_step(temp.path());
        let structure = silicon();
        let choice = dftb_choice();
        let mut context = context(&structure, &choice);
        context.previous_energy = Some(&previous);

        let StepInput::Run(prepared) = dos_input(&DosParams::default(), &context).unwrap() else {
            panic!("DOS was skipped");
        };
        let block = dftb(&prepared);
        assert_eq!(block.get("MaxSCCIterations"), Some(&ConfigValue::from(1u32)));
        assert!(is_yes(block, "ReadInitialCharges"));
        assert!(!block.contains_key("InitialCharges"));
        assert_eq!(block.get("SCCTolerance"), Some(&ConfigValue::from(10.0)));

        let analysis = prepared.input.get_tree("Analysis").unwrap();
        assert!(is_yes(analysis, "PrintForces"));
        assert!(!is_yes(analysis, "CalculateForces"));
        let region = analysis
            .get_tree("ProjectStates")
            .and_then(|p| p.get_tree("Region<1>"))
            .unwrap();
        assert_eq!(region.get("Label"), Some(&ConfigValue::from("\"pdos_Si\"")));
        let text = emit(&prepared.input);
        assert!(text.contains("        Region {\n"));
        assert!(!text.contains("Region<"));
        assert!(!text.contains("Region1"));
        assert_eq!(prepared.charges_from, Some(temp.path().join(CHARGES_FILE)));
    }

    #[test]
    fn test_dos_skipped_for_molecules() {
        let structure = water();
        let choice = dftb_choice();
        assert_eq!(
            dos_input(&DosParams::default(), &context(&structure, &choice)).unwrap(),
            StepInput::Skip("The system is not periodic, so the DOS will not be calculated.".to_string())
        );
    }

    #[test]
    fn test_band_structure_input() {
        let temp = TempDir::new().unwrap();
        let previous = previous_step(temp.path());
        let structure = silicon();
        let choice = dftb_choice();
        let mut context = context(&structure, &choice);
        context.previous_energy = Some(&previous);

        let path = BandPath {
            points: BTreeMap::from([
                ("Γ".to_string(), [0.0, 0.0, 0.0]),
                ("X".to_string(), [0.5, 0.0, 0.5]),
            ]),
            segments: vec![("Γ".to_string(), "X".to_string())],
        };
        let params = BandStructureParams {
            n_points: 10,
            path: Some(path),
        };
        let StepInput::Run(prepared) = band_structure_input(&params, &context).unwrap() else {
            panic!("band structure was skipped");
        };
        assert!(prepared.klines.is_some());
        let text = emit(&prepared.input);
        assert!(text.contains("KPointsAndWeights = Klines {"));
        assert!(is_yes(prepared.input.get_tree("Options").unwrap(), "ReadChargesAsText"));
    }

    #[test]
    fn test_band_structure_needs_previous_step() {
        let structure = silicon();
        let choice = dftb_choice();
        let params = BandStructureParams {
            n_points: 10,
            path: Some(BandPath {
                points: BTreeMap::new(),
                segments: Vec::new(),
            }),
        };
        assert!(matches!(
            band_structure_input(&params, &context(&structure, &choice)),
            Err(StepError::MissingPreviousStep(_))
        ));
    }

    #[test]
    fn test_input_only_writes_input() {
        let temp = TempDir::new().unwrap();
        let metadata = SlakoMetadata::from_json(WATER_METADATA).unwrap();
        let flowchart = Flowchart::new(temp.path(), Settings::default())
            .with_metadata(metadata)
            .with_spin_constants(SpinConstants::default());
        let steps = vec![
            StepKind::ChooseParameters(ChooseParametersParams {
                dataset: "3ob".to_string(),
                subset: "none".to_string(),
            }),
            StepKind::Energy(EnergyParams {
                input_only: true,
                ..EnergyParams::default()
            }),
        ];
        let report = flowchart.run(&water(), &steps).unwrap();
        assert_eq!(report.steps[0].status, StepStatus::Configured);
        assert_eq!(report.steps[1].status, StepStatus::InputOnly);

        let text = fs::read_to_string(temp.path().join("2").join("dftb_in.hsd")).unwrap();
        assert!(text.starts_with("Options {\n    WriteResultsTag = Yes\n    WriteChargesAsText = Yes\n}\n"));
        assert!(text.contains("SlaterKosterFiles"));
        assert!(!temp.path().join("2").join(SUCCESS_FILE).exists());
    }

    #[test]
    fn test_empty_structure_is_rejected() {
        let temp = TempDir::new().unwrap();
        let flowchart = Flowchart::new(temp.path(), Settings::default());
        let empty = Structure::molecule(Vec::new(), Vec::new());
        assert!(matches!(flowchart.run(&empty, &[]), Err(StepError::NoStructure)));
    }
}
