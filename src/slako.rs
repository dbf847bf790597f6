//! Slater–Koster parameter sets and spin constants.
//!
//! The parameter metadata is a JSON document describing every available
//! model (`DFTB`, `xTB`), the parameter files known by their md5 sums, and the
//! datasets built from them:
//!
//! ```json
//! {
//!   "DFTB": {
//!     "potentials": {"<md5>": {"filename": "3ob/C-H.skf"}},
//!     "datasets": {
//!       "DFTB - 3ob": {
//!         "potential pairs": {"C-H": {"md5sum": "<md5>"}},
//!         "element data": {"C": {"maximum angular momentum": "p"}},
//!         "defaults": {"Energy": {"SCC": {"ThirdOrder": "Full"}}}
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! [`choose_parameters`] turns a dataset name, an optional subset and the
//! elements of a structure into the `Hamiltonian` part of the DFTB+ input,
//! together with what later steps need to know about the choice
//! ([`ParameterChoice`]).

use crate::hsd::ConfigTree;
use lazy_static::lazy_static;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while choosing parameters.
#[derive(Error, Debug)]
pub enum SlakoError {
    /// Reading a metadata file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A metadata file is not valid JSON for its layout
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The dataset or subset is not in the metadata
    #[error("Unknown Slater-Koster dataset '{0}'")]
    UnknownDataset(String),
    /// The model is neither DFTB nor xTB
    #[error("Unsupported model '{0}'")]
    UnknownModel(String),
    /// No parameter file for an element pair
    #[error("Could not find the Slater-Koster file for {pair} for dataset {dataset}, subset {subset}.")]
    MissingPair {
        /// The pair, e.g. `C-H`
        pair: String,
        /// Dataset name
        dataset: String,
        /// Subset name
        subset: String,
    },
    /// A pair refers to a file that is not listed
    #[error("No potential file with md5 sum {0}")]
    MissingPotential(String),
    /// An element lacks required data
    #[error("No {what} for element {element} in dataset {dataset}")]
    MissingElement {
        /// The element symbol
        element: String,
        /// What was missing
        what: String,
        /// Dataset name
        dataset: String,
    },
    /// The spin constants cannot be used for an element
    #[error("Error in spin constants for {element}: {message}")]
    SpinConstants {
        /// The element symbol
        element: String,
        /// What went wrong
        message: String,
    },
}

type Result<T> = std::result::Result<T, SlakoError>;

/// A parameter file known by its md5 sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PotentialFile {
    /// Path relative to the Slater–Koster directory
    pub filename: String,
}

/// One entry of a dataset's pair table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairEntry {
    /// md5 sum of the parameter file
    pub md5sum: String,
}

/// Per-element data of a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementData {
    /// Highest angular momentum of the basis, `s`, `p`, `d` or `f`
    #[serde(rename = "maximum angular momentum", default)]
    pub maximum_angular_momentum: Option<String>,
    /// Derivative of the Hubbard U, for third-order DFTB
    #[serde(rename = "Hubbard derivative", default)]
    pub hubbard_derivative: Option<f64>,
    /// Energy of the free atom, E_h
    #[serde(rename = "reference energy", default)]
    pub reference_energy: Option<f64>,
}

/// The default value of the H correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HCorrectionDefault {
    /// `Damping`, `DFTB3-D3H5`, ...
    pub value: String,
    /// Exponent for the damping correction
    #[serde(rename = "Damping Exponent", default)]
    pub damping_exponent: Option<f64>,
}

/// Defaults a dataset declares for the Hamiltonian.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HamiltonianDefaults {
    /// `No`, `Partial` or `Full`
    #[serde(rename = "ThirdOrder", default)]
    pub third_order: Option<String>,
    /// Default hydrogen correction
    #[serde(rename = "HCorrection", default)]
    pub h_correction: Option<HCorrectionDefault>,
}

/// A set of Slater–Koster parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Parameter file for each element pair
    #[serde(rename = "potential pairs", default)]
    pub potential_pairs: BTreeMap<String, PairEntry>,
    /// Per-element data
    #[serde(rename = "element data", default)]
    pub element_data: BTreeMap<String, ElementData>,
    /// Defaults keyed by calculation, then by `SCC`
    #[serde(default)]
    pub defaults: BTreeMap<String, BTreeMap<String, HamiltonianDefaults>>,
}

impl Dataset {
    fn scc_defaults(&self) -> Option<&HamiltonianDefaults> {
        self.defaults.get("Energy").and_then(|energy| energy.get("SCC"))
    }
}

/// Everything known about one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Parameter files keyed by md5 sum
    #[serde(default)]
    pub potentials: BTreeMap<String, PotentialFile>,
    /// Datasets keyed by their full name, e.g. `DFTB - 3ob`
    #[serde(default)]
    pub datasets: BTreeMap<String, Dataset>,
}

/// The whole parameter metadata document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlakoMetadata {
    models: BTreeMap<String, ModelEntry>,
}

impl SlakoMetadata {
    /// Parses the metadata from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads the metadata file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Looks up a model.
    pub fn model(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    /// Resolves a dataset name to `(model, full name)`.
    ///
    /// Names already of the form `<model> - <name>` are taken as they are;
    /// bare names are looked for under every model in turn.
    pub fn resolve_dataset(&self, name: &str) -> Result<(String, String)> {
        if let Some((model, _)) = name.split_once(" - ") {
            return Ok((model.to_string(), name.to_string()));
        }
        self.models
            .iter()
            .find_map(|(model, entry)| {
                let full = format!("{} - {}", model, name);
                entry
                    .datasets
                    .contains_key(&full)
                    .then(|| (model.clone(), full))
            })
            .ok_or_else(|| SlakoError::UnknownDataset(name.to_string()))
    }
}

/// The family of Hamiltonian a dataset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Density-functional tight binding with Slater–Koster files
    #[serde(rename = "DFTB")]
    Dftb,
    /// Extended tight binding
    #[serde(rename = "xTB")]
    Xtb,
}

impl ModelKind {
    /// The name of the Hamiltonian block in the input.
    pub fn hamiltonian_key(&self) -> &'static str {
        match self {
            ModelKind::Dftb => "DFTB",
            ModelKind::Xtb => "xTB",
        }
    }
}

/// The outcome of choosing parameters, handed to later steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterChoice {
    /// The `Hamiltonian` input for the chosen parameters
    pub input: ConfigTree,
    /// Model string such as `DFTB/3ob` or `DFTB/3ob+3ob-hhmod`
    pub model: String,
    /// DFTB or xTB
    pub kind: ModelKind,
    /// SCC defaults, subset over dataset
    pub defaults: HamiltonianDefaults,
    /// Free-atom energies, present only if every element has one
    pub reference_energies: Option<BTreeMap<String, f64>>,
}

fn quoted(value: &str) -> String {
    if value.starts_with('"') {
        value.to_string()
    } else {
        format!("\"{}\"", value)
    }
}

fn element_value<'a, T>(
    element: &str,
    dataset: &'a Dataset,
    subset: Option<&'a Dataset>,
    field: impl Fn(&'a ElementData) -> Option<T>,
) -> Option<T> {
    subset
        .and_then(|s| s.element_data.get(element))
        .and_then(&field)
        .or_else(|| dataset.element_data.get(element).and_then(&field))
}

/// Chooses the parameters for `elements` (sorted, without duplicates).
///
/// `subset` is `None`, empty or `"none"` when no specialised set is layered
/// over the dataset. Slater–Koster file paths are made absolute with respect
/// to `slako_dir`.
pub fn choose_parameters(
    metadata: &SlakoMetadata,
    dataset_name: &str,
    subset_name: Option<&str>,
    elements: &[&str],
    slako_dir: &Path,
) -> Result<ParameterChoice> {
    let (model_name, full_name) = metadata.resolve_dataset(dataset_name)?;
    let model = metadata
        .model(&model_name)
        .ok_or_else(|| SlakoError::UnknownModel(model_name.clone()))?;
    let dataset = model
        .datasets
        .get(&full_name)
        .ok_or_else(|| SlakoError::UnknownDataset(full_name.clone()))?;
    let parameter_set_name = full_name
        .split_once(" - ")
        .map(|(_, name)| name)
        .unwrap_or(full_name.as_str());

    match model_name.as_str() {
        "DFTB" => {}
        "xTB" => {
            let mut input = ConfigTree::new();
            input
                .tree_mut("Hamiltonian")
                .tree_mut("xTB")
                .insert("Method", format!("{}-xTB", parameter_set_name));
            return Ok(ParameterChoice {
                input,
                model: full_name.replace(" - ", "/"),
                kind: ModelKind::Xtb,
                defaults: HamiltonianDefaults::default(),
                reference_energies: None,
            });
        }
        other => return Err(SlakoError::UnknownModel(other.to_string())),
    }

    let mut model_string = full_name.replace(" - ", "/");
    let subset_name = subset_name.filter(|s| !s.is_empty() && *s != "none");
    let subset = match subset_name {
        Some(name) => {
            let full = if name.contains(" - ") {
                name.to_string()
            } else {
                format!("{} - {}", model_name, name)
            };
            let short = full.split_once(" - ").map(|(_, s)| s).unwrap_or(&full);
            model_string.push('+');
            model_string.push_str(short);
            Some(
                model
                    .datasets
                    .get(&full)
                    .ok_or_else(|| SlakoError::UnknownDataset(full.clone()))?,
            )
        }
        None => None,
    };

    let mut files = ConfigTree::new();
    for el1 in elements {
        for el2 in elements {
            let key = format!("{}-{}", el1, el2);
            let flipped = format!("{}-{}", el2, el1);
            let entry = subset
                .and_then(|s| s.potential_pairs.get(&key))
                .or_else(|| dataset.potential_pairs.get(&key))
                .or_else(|| subset.and_then(|s| s.potential_pairs.get(&flipped)))
                .or_else(|| dataset.potential_pairs.get(&flipped))
                .ok_or_else(|| SlakoError::MissingPair {
                    pair: key.clone(),
                    dataset: dataset_name.to_string(),
                    subset: subset_name.unwrap_or("none").to_string(),
                })?;
            let potential = model
                .potentials
                .get(&entry.md5sum)
                .ok_or_else(|| SlakoError::MissingPotential(entry.md5sum.clone()))?;
            let path = slako_dir.join(&potential.filename);
            files.insert(&key, quoted(&path.display().to_string()));
        }
    }

    let mut max_momentum = ConfigTree::new();
    for element in elements {
        let momentum = element_value(element, dataset, subset, |d| {
            d.maximum_angular_momentum.as_deref()
        })
        .ok_or_else(|| SlakoError::MissingElement {
            element: element.to_string(),
            what: "maximum angular momentum".to_string(),
            dataset: full_name.clone(),
        })?;
        max_momentum.insert(element, quoted(momentum));
    }

    let mut input = ConfigTree::new();
    let hamiltonian = input.tree_mut("Hamiltonian").tree_mut("DFTB");
    hamiltonian.insert("SlaterKosterFiles", files);
    hamiltonian.insert("MaxAngularMomentum", max_momentum);

    let derivatives: ConfigTree = elements
        .iter()
        .filter_map(|el| {
            element_value(el, dataset, subset, |d| d.hubbard_derivative).map(|v| (*el, v))
        })
        .collect();
    if !derivatives.is_empty() {
        hamiltonian.insert("HubbardDerivs", derivatives);
    }

    let reference_energies: Option<BTreeMap<String, f64>> = elements
        .iter()
        .map(|el| {
            element_value(el, dataset, subset, |d| d.reference_energy).map(|e| (el.to_string(), e))
        })
        .collect();

    let defaults = subset
        .and_then(|s| s.scc_defaults())
        .or_else(|| dataset.scc_defaults())
        .cloned()
        .unwrap_or_default();

    debug!("Chose parameters {} for elements {:?}", model_string, elements);
    Ok(ParameterChoice {
        input,
        model: model_string,
        kind: ModelKind::Dftb,
        defaults,
        reference_energies,
    })
}

lazy_static! {
    static ref ELEMENT_SYMBOLS: HashMap<&'static str, u32> = [
        "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S",
        "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga",
        "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd",
        "Ag", "Cd", "In", "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm",
        "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os",
        "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", "Pa",
        "U", "Np", "Pu", "Am", "Cm", "Bk", "Cf", "Es", "Fm", "Md", "No", "Lr", "Rf", "Db", "Sg",
        "Bh", "Hs", "Mt", "Ds", "Rg", "Cn", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
    ]
    .iter()
    .enumerate()
    .map(|(i, symbol)| (*symbol, i as u32 + 1))
    .collect();
}

/// The last subshell of an element's ground-state configuration, written in
/// order of increasing principal quantum number: `s`, `p` or `d`.
pub fn valence_shell(element: &str) -> Option<char> {
    let z = *ELEMENT_SYMBOLS.get(element)?;
    let shell = match z {
        5..=10 | 13..=18 | 31..=36 | 49..=54 | 81..=86 | 103 | 113..=118 => 'p',
        46 => 'd',
        _ => 's',
    };
    Some(shell)
}

/// Atomic spin constants, W, keyed by functional and element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpinConstants {
    sets: BTreeMap<String, BTreeMap<String, Vec<f64>>>,
}

impl SpinConstants {
    /// Parses the constants from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads the constants file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// The `SpinConstants` block for `elements` under `model`.
    ///
    /// The set is chosen by the part of the model string after `/`, falling
    /// back to `GGA`. Sets with more than three constants for any element are
    /// shell resolved (1, 4 or 9 values for s, p, d bases); they are written
    /// out in full only when `shell_resolved` is requested. Otherwise each
    /// element gets the single constant of its valence shell.
    pub fn to_input(&self, model: &str, elements: &[&str], shell_resolved: bool) -> Result<ConfigTree> {
        let key = model.split_once('/').map(|(_, name)| name).unwrap_or(model);
        let constants = self
            .sets
            .get(key)
            .or_else(|| self.sets.get("GGA"))
            .ok_or_else(|| SlakoError::SpinConstants {
                element: elements.join(", "),
                message: format!("no constants for '{}' or GGA", key),
            })?;
        let lookup = |element: &str| {
            constants
                .get(element)
                .ok_or_else(|| SlakoError::SpinConstants {
                    element: element.to_string(),
                    message: "no constants".to_string(),
                })
        };

        let mut available = false;
        for element in elements {
            if lookup(element)?.len() > 3 {
                available = true;
                break;
            }
        }
        let resolved = available && shell_resolved;

        let mut block = ConfigTree::new();
        block.insert("ShellResolvedSpin", resolved);
        for element in elements {
            let values = lookup(element)?;
            if resolved {
                let joined: Vec<String> = values.iter().map(|v| format!("{:?}", v)).collect();
                block.insert(element, format!("{{{}}}", joined.join(" ")));
                continue;
            }
            let error = || SlakoError::SpinConstants {
                element: element.to_string(),
                message: format!("{:?}", values),
            };
            let value = match (valence_shell(element), values.len()) {
                (Some('s'), n) if n > 0 => values[0],
                (Some('p'), 4) => values[3],
                (Some('p'), 9) => values[4],
                (Some('d'), 9) => values[8],
                _ => return Err(error()),
            };
            block.insert(element, value);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsd::{emit, Scalar};

    const METADATA: &str = r#"{
        "DFTB": {
            "potentials": {
                "aa": {"filename": "3ob/C-C.skf"},
                "ab": {"filename": "3ob/C-H.skf"},
                "bb": {"filename": "3ob/H-H.skf"},
                "hh": {"filename": "hhmod/H-H.skf"}
            },
            "datasets": {
                "DFTB - 3ob": {
                    "potential pairs": {
                        "C-C": {"md5sum": "aa"},
                        "C-H": {"md5sum": "ab"},
                        "H-H": {"md5sum": "bb"}
                    },
                    "element data": {
                        "C": {"maximum angular momentum": "p", "Hubbard derivative": -0.1492, "reference energy": -1.4},
                        "H": {"maximum angular momentum": "\"s\"", "Hubbard derivative": -0.1857}
                    },
                    "defaults": {"Energy": {"SCC": {"ThirdOrder": "Full", "HCorrection": {"value": "Damping", "Damping Exponent": 4.0}}}}
                },
                "DFTB - hhmod": {
                    "potential pairs": {"H-H": {"md5sum": "hh"}},
                    "element data": {"H": {"reference energy": -0.24}}
                }
            }
        },
        "xTB": {
            "datasets": {"xTB - GFN2": {}}
        }
    }"#;

    fn metadata() -> SlakoMetadata {
        SlakoMetadata::from_json(METADATA).unwrap()
    }

    #[test]
    fn test_resolve_dataset() {
        let metadata = metadata();
        assert_eq!(
            metadata.resolve_dataset("3ob").unwrap(),
            ("DFTB".to_string(), "DFTB - 3ob".to_string())
        );
        assert_eq!(
            metadata.resolve_dataset("GFN2").unwrap(),
            ("xTB".to_string(), "xTB - GFN2".to_string())
        );
        assert!(matches!(
            metadata.resolve_dataset("mio"),
            Err(SlakoError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_choose_dftb_parameters() {
        let choice =
            choose_parameters(&metadata(), "DFTB - 3ob", None, &["C", "H"], Path::new("/sk")).unwrap();
        assert_eq!(choice.model, "DFTB/3ob");
        assert_eq!(choice.kind, ModelKind::Dftb);
        assert_eq!(choice.defaults.third_order.as_deref(), Some("Full"));
        // H has no reference energy in the plain dataset
        assert_eq!(choice.reference_energies, None);

        let text = emit(&choice.input);
        assert!(text.contains("            H-C = \"/sk/3ob/C-H.skf\"\n"));
        assert!(text.contains("            C = \"p\"\n            H = \"s\"\n"));
        assert!(text.contains("HubbardDerivs {\n            C = -0.1492\n"));
    }

    #[test]
    fn test_subset_overrides_dataset() {
        let choice =
            choose_parameters(&metadata(), "3ob", Some("hhmod"), &["C", "H"], Path::new("/sk")).unwrap();
        assert_eq!(choice.model, "DFTB/3ob+hhmod");
        let files = choice
            .input
            .get_path(&["Hamiltonian", "DFTB", "SlaterKosterFiles", "H-H"])
            .and_then(|v| v.as_scalar());
        assert_eq!(files, Some(&Scalar::Text("\"/sk/hhmod/H-H.skf\"".to_string())));
        let references = choice.reference_energies.unwrap();
        assert_eq!(references["C"], -1.4);
        assert_eq!(references["H"], -0.24);
        // The subset has no defaults of its own
        assert!(choice.defaults.h_correction.is_some());
    }

    #[test]
    fn test_missing_pair() {
        let result = choose_parameters(&metadata(), "3ob", None, &["C", "N"], Path::new("/sk"));
        assert!(matches!(result, Err(SlakoError::MissingPair { pair, .. }) if pair == "C-N"));
    }

    #[test]
    fn test_xtb_method() {
        let choice = choose_parameters(&metadata(), "GFN2", None, &["C"], Path::new("/sk")).unwrap();
        assert_eq!(choice.kind, ModelKind::Xtb);
        assert_eq!(choice.model, "xTB/GFN2");
        assert_eq!(
            emit(&choice.input),
            "Hamiltonian {\n    xTB {\n        Method = GFN2-xTB\n    }\n}\n"
        );
    }

    #[test]
    fn test_valence_shell() {
        assert_eq!(valence_shell("H"), Some('s'));
        assert_eq!(valence_shell("C"), Some('p'));
        assert_eq!(valence_shell("Fe"), Some('s'));
        assert_eq!(valence_shell("Pd"), Some('d'));
        assert_eq!(valence_shell("Xx"), None);
    }

    #[test]
    fn test_spin_constants() {
        let constants = SpinConstants::from_json(
            r#"{
                "GGA": {
                    "H": [-0.072],
                    "C": [-0.031, -0.025, -0.025, -0.023]
                },
                "mio": {"H": [-0.064], "C": [-0.028, -0.024]}
            }"#,
        )
        .unwrap();

        let resolved = constants.to_input("DFTB/3ob", &["C", "H"], true).unwrap();
        assert_eq!(
            emit(&resolved),
            "ShellResolvedSpin = Yes\nC = {-0.031 -0.025 -0.025 -0.023}\nH = {-0.072}\n"
        );

        let single = constants.to_input("DFTB/3ob", &["C", "H"], false).unwrap();
        assert_eq!(emit(&single), "ShellResolvedSpin = No\nC = -0.023\nH = -0.072\n");

        // Two constants for a p element cannot be reduced
        assert!(matches!(
            constants.to_input("DFTB/mio", &["C"], false),
            Err(SlakoError::SpinConstants { .. })
        ));
    }
}
