//! Parameters of the calculation steps.
//!
//! A job is a list of steps, each one a [`StepKind`] carrying its own
//! parameters. Every parameter struct deserializes with defaults for missing
//! fields, so a job file only needs to name what differs:
//!
//! ```json
//! {"kind": "energy", "filling": "Gaussian", "filling_temperature": 1000.0}
//! ```
//!
//! Units follow DFTB+: energies in E_h, forces in E_h/bohr, temperatures in
//! K and k-point spacings in 1/Å.

use crate::kpoints::{BandPath, KGrid};
use serde::{Deserialize, Serialize};

/// Unit conversion constant: Hartree to electron volt
pub const HARTREE_TO_EV: f64 = 27.211386245988;
/// Unit conversion constant: Hartree to kJ/mol
pub const HARTREE_TO_KJ_PER_MOL: f64 = 2625.499639;

/// Parameters for choosing the Slater–Koster set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChooseParametersParams {
    /// Dataset, with or without the `<model> - ` prefix
    pub dataset: String,
    /// Specialised set layered over the dataset, or `none`
    pub subset: String,
}

impl Default for ChooseParametersParams {
    fn default() -> Self {
        Self {
            dataset: "3ob".to_string(),
            subset: "none".to_string(),
        }
    }
}

/// Electronic smearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Filling {
    /// Fermi–Dirac
    #[default]
    Fermi,
    /// Gaussian, written as first-order Methfessel–Paxton
    Gaussian,
    /// Second-order Methfessel–Paxton
    #[serde(rename = "Methfessel-Paxton", alias = "MethfesselPaxton")]
    MethfesselPaxton,
}

/// Where the starting charges come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitialCharges {
    /// The previous step's charges if there are any, else the structure's
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Neutral atoms
    #[serde(rename = "none")]
    None,
    /// The previous step's charge file, which must exist
    #[serde(rename = "from previous step")]
    FromPreviousStep,
    /// The charges stored on the structure
    #[serde(rename = "from structure")]
    FromStructure,
}

/// Third-order DFTB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThirdOrder {
    /// Second order only
    No,
    /// Whatever the dataset declares, else `No`
    #[default]
    #[serde(rename = "default for parameters", alias = "Default for parameters")]
    DefaultForParameters,
    /// On-site third order terms only
    Partial,
    /// Full third order
    Full,
}

impl ThirdOrder {
    /// Parses the value a dataset declares as its default.
    pub fn from_default(value: &str) -> Option<Self> {
        match value {
            "No" => Some(ThirdOrder::No),
            "Partial" => Some(ThirdOrder::Partial),
            "Full" => Some(ThirdOrder::Full),
            _ => None,
        }
    }
}

/// Correction of hydrogen bonding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HCorrection {
    /// No correction
    None,
    /// Whatever the dataset declares, else `None`
    #[default]
    #[serde(rename = "default for parameters", alias = "Default for parameters")]
    DefaultForParameters,
    /// Damping of the short-range Coulomb interaction
    Damping,
    /// The D3H5 correction for DFTB3
    #[serde(rename = "DFTB3-D3H5")]
    Dftb3D3H5,
}

/// Spin treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpinPolarisation {
    /// Spin polarised unless the system is a closed-shell singlet
    #[default]
    #[serde(rename = "from system")]
    FromSystem,
    /// Spin restricted
    #[serde(rename = "none")]
    None,
    /// Collinear spin polarisation
    #[serde(rename = "collinear")]
    Collinear,
    /// Non-collinear spin polarisation
    #[serde(rename = "noncollinear")]
    NonCollinear,
}

fn energy_k_grid() -> KGrid {
    KGrid::GridSpacing { spacing: 0.2 }
}

/// Parameters for a single-point energy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyParams {
    /// Write `dftb_in.hsd` without running DFTB+
    pub input_only: bool,
    /// Self-consistent charges
    pub scc: bool,
    /// Largest charge change between SCC cycles
    pub scc_tolerance: f64,
    /// SCC cycle limit
    pub max_scc_iterations: u32,
    /// Electronic smearing
    pub filling: Filling,
    /// Smearing temperature, K
    pub filling_temperature: f64,
    /// Source of the starting charges
    pub initial_charges: InitialCharges,
    /// Third-order DFTB
    pub third_order: ThirdOrder,
    /// Hydrogen-bond correction
    pub h_correction: HCorrection,
    /// Exponent for the damping correction when the dataset has none
    pub damping_exponent: f64,
    /// Brillouin-zone mesh for periodic systems
    pub k_grid: KGrid,
    /// Spin treatment
    pub spin_polarisation: SpinPolarisation,
    /// Let the total spin relax
    pub relax_total_spin: bool,
    /// Use shell-resolved spin constants when the set has them
    pub shell_resolved_spin: bool,
    /// Start from the spins stored on the structure
    pub use_atom_spins: bool,
    /// Write eigenvectors and `detailed.xml`
    pub write_eigenvectors: bool,
}

impl Default for EnergyParams {
    fn default() -> Self {
        Self {
            input_only: false,
            scc: true,
            scc_tolerance: 1.0e-5,
            max_scc_iterations: 100,
            filling: Filling::Fermi,
            filling_temperature: 300.0,
            initial_charges: InitialCharges::Default,
            third_order: ThirdOrder::DefaultForParameters,
            h_correction: HCorrection::DefaultForParameters,
            damping_exponent: 4.0,
            k_grid: energy_k_grid(),
            spin_polarisation: SpinPolarisation::FromSystem,
            relax_total_spin: true,
            shell_resolved_spin: true,
            use_atom_spins: true,
            write_eigenvectors: false,
        }
    }
}

fn default_diag_limit() -> f64 {
    0.01
}

fn default_memory() -> u32 {
    20
}

fn default_step_size() -> f64 {
    100.0
}

fn default_n_min() -> u32 {
    5
}

fn default_a_par() -> f64 {
    0.1
}

fn default_f_inc() -> f64 {
    1.1
}

fn default_f_dec() -> f64 {
    0.5
}

fn default_f_alpha() -> f64 {
    0.99
}

/// Geometry optimizer of DFTB+.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum OptimizationMethod {
    /// Rational function optimizer
    #[serde(rename = "Rational Function")]
    RationalFunction {
        /// Limit on the size of the Hessian diagonal
        #[serde(default = "default_diag_limit")]
        diag_limit: f64,
    },
    /// Limited-memory BFGS
    #[serde(rename = "LBFGS")]
    Lbfgs {
        /// Number of past steps kept
        #[serde(default = "default_memory")]
        memory: u32,
    },
    /// Fast inertial relaxation engine
    #[serde(rename = "FIRE")]
    Fire {
        /// Time step
        #[serde(default = "default_step_size")]
        step_size: f64,
        /// Steps before the time step may grow
        #[serde(default = "default_n_min")]
        n_min: u32,
        /// Initial mixing parameter
        #[serde(default = "default_a_par")]
        a_par: f64,
        /// Time step growth factor
        #[serde(default = "default_f_inc")]
        f_inc: f64,
        /// Time step reduction factor
        #[serde(default = "default_f_dec")]
        f_dec: f64,
        /// Mixing parameter decay
        #[serde(default = "default_f_alpha")]
        f_alpha: f64,
    },
}

impl Default for OptimizationMethod {
    fn default() -> Self {
        OptimizationMethod::RationalFunction {
            diag_limit: default_diag_limit(),
        }
    }
}

/// Parameters for a geometry optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationParams {
    /// The Hamiltonian settings
    #[serde(flatten)]
    pub energy: EnergyParams,
    /// The optimizer
    pub method: OptimizationMethod,
    /// Convergence on the largest force component, E_h/bohr
    pub max_force_component: f64,
    /// Optimizer step limit
    pub max_steps: u32,
    /// Optimize the lattice of periodic systems too
    pub lattice_opt: bool,
    /// Hand the optimized structure to later steps
    pub update_structure: bool,
}

impl Default for OptimizationParams {
    fn default() -> Self {
        Self {
            energy: EnergyParams::default(),
            method: OptimizationMethod::default(),
            max_force_component: 1.0e-4,
            max_steps: 200,
            lattice_opt: true,
            update_structure: true,
        }
    }
}

/// Parameters for a band structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandStructureParams {
    /// Approximate number of k-points along the path
    pub n_points: usize,
    /// High-symmetry points and segments
    pub path: Option<BandPath>,
}

impl Default for BandStructureParams {
    fn default() -> Self {
        Self {
            n_points: 100,
            path: None,
        }
    }
}

/// Parameters for a density of states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DosParams {
    /// Brillouin-zone mesh
    pub k_grid: KGrid,
}

impl Default for DosParams {
    fn default() -> Self {
        Self {
            k_grid: KGrid::GridSpacing { spacing: 0.05 },
        }
    }
}

/// One step of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Choose the Slater–Koster parameters used by later steps
    ChooseParameters(ChooseParametersParams),
    /// Single-point energy
    Energy(EnergyParams),
    /// Geometry optimization
    Optimization(OptimizationParams),
    /// Band structure along a path
    BandStructure(BandStructureParams),
    /// Total and projected density of states
    Dos(DosParams),
}

impl StepKind {
    /// Display name of the step.
    pub fn title(&self) -> &'static str {
        match self {
            StepKind::ChooseParameters(_) => "Choose Parameters",
            StepKind::Energy(_) => "Energy",
            StepKind::Optimization(_) => "Optimization",
            StepKind::BandStructure(_) => "Band Structure",
            StepKind::Dos(_) => "DOS",
        }
    }

    /// Whether the step runs DFTB+ or only contributes input.
    pub fn is_runnable(&self) -> bool {
        !matches!(self, StepKind::ChooseParameters(_))
    }

    /// The Hamiltonian settings of energy-like steps.
    pub fn energy_params(&self) -> Option<&EnergyParams> {
        match self {
            StepKind::Energy(p) => Some(p),
            StepKind::Optimization(p) => Some(&p.energy),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_defaults() {
        let step: StepKind = serde_json::from_str(r#"{"kind": "energy"}"#).unwrap();
        assert_eq!(step, StepKind::Energy(EnergyParams::default()));
        assert!(step.is_runnable());
    }

    #[test]
    fn test_energy_options() {
        let step: StepKind = serde_json::from_str(
            r#"{
                "kind": "energy",
                "filling": "Methfessel-Paxton",
                "initial_charges": "from structure",
                "third_order": "Partial",
                "h_correction": "DFTB3-D3H5",
                "spin_polarisation": "collinear",
                "k_grid": {"method": "supercell_folding", "na": 2, "nb": 2, "nc": 1}
            }"#,
        )
        .unwrap();
        let params = step.energy_params().unwrap();
        assert_eq!(params.filling, Filling::MethfesselPaxton);
        assert_eq!(params.initial_charges, InitialCharges::FromStructure);
        assert_eq!(params.third_order, ThirdOrder::Partial);
        assert_eq!(params.h_correction, HCorrection::Dftb3D3H5);
        assert_eq!(params.spin_polarisation, SpinPolarisation::Collinear);
        assert_eq!(params.k_grid, KGrid::SupercellFolding { na: 2, nb: 2, nc: 1 });
        assert_eq!(params.scc_tolerance, 1.0e-5);
    }

    #[test]
    fn test_optimization_flattens_energy() {
        let step: StepKind = serde_json::from_str(
            r#"{"kind": "optimization", "scc_tolerance": 1e-7, "method": {"algorithm": "FIRE", "n_min": 3}}"#,
        )
        .unwrap();
        match step {
            StepKind::Optimization(params) => {
                assert_eq!(params.energy.scc_tolerance, 1.0e-7);
                assert_eq!(params.max_steps, 200);
                assert_eq!(
                    params.method,
                    OptimizationMethod::Fire {
                        step_size: 100.0,
                        n_min: 3,
                        a_par: 0.1,
                        f_inc: 1.1,
                        f_dec: 0.5,
                        f_alpha: 0.99,
                    }
                );
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_choose_parameters_is_not_runnable() {
        let step: StepKind =
            serde_json::from_str(r#"{"kind": "choose_parameters", "dataset": "DFTB - mio"}"#).unwrap();
        assert!(!step.is_runnable());
        assert_eq!(
            step,
            StepKind::ChooseParameters(ChooseParametersParams {
                dataset: "DFTB - mio".to_string(),
                subset: "none".to_string(),
            })
        );
    }

    #[test]
    fn test_dos_default_mesh() {
        let step: StepKind = serde_json::from_str(r#"{"kind": "dos"}"#).unwrap();
        assert_eq!(
            step,
            StepKind::Dos(DosParams {
                k_grid: KGrid::GridSpacing { spacing: 0.05 }
            })
        );
    }
}
