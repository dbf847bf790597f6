//! Descriptions of the properties DFTB+ reports.
//!
//! The results parser looks every record up in a [`PropertyTable`] so it can
//! attach units and warn about keys nobody knows. [`PropertyTable::standard`]
//! holds the properties written by DFTB+ itself plus the ones derived during
//! analysis (energy of formation, RMSD, ...). A different table can be
//! loaded from JSON with [`PropertyTable::from_json`].

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One axis of a property's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Extent {
    /// A fixed length
    Fixed(usize),
    /// A length that depends on the system, such as `natoms`
    Named(String),
}

/// Marker for scalar properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarMarker {
    /// The literal `"scalar"`
    Scalar,
}

/// Shape of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimensionality {
    /// A single value
    Scalar(ScalarMarker),
    /// An array with the given extents
    Array(Vec<Extent>),
}

/// What is known about one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMetadata {
    /// Human-readable description
    pub description: String,
    /// Shape of the value
    pub dimensionality: Dimensionality,
    /// Element type: `float`, `integer`, `int` or `string`
    #[serde(rename = "type")]
    pub value_type: String,
    /// Units, if the value has any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Calculation kinds that produce the property
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calculation: Vec<String>,
    /// Property name template used when storing the value in a database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

/// Mapping from result key to [`PropertyMetadata`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyTable {
    entries: BTreeMap<String, PropertyMetadata>,
}

impl PropertyTable {
    /// The built-in table.
    pub fn standard() -> &'static PropertyTable {
        &STANDARD_PROPERTIES
    }

    /// Reads a table from a JSON object keyed by property name.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Looks up a property.
    pub fn get(&self, key: &str) -> Option<&PropertyMetadata> {
        self.entries.get(key)
    }

    /// True if the property is known.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Units declared for a property, if any. An empty unit string counts as
    /// a declaration.
    pub fn units(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|m| m.units.as_deref())
    }

    /// Adds or replaces a property.
    pub fn insert(&mut self, key: &str, metadata: PropertyMetadata) {
        self.entries.insert(key.to_string(), metadata);
    }

    /// Number of known properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

const ENERGY_AND_OPT: &[&str] = &["energy", "optimization"];
const OPT_ONLY: &[&str] = &["optimization"];

fn scalar() -> Dimensionality {
    Dimensionality::Scalar(ScalarMarker::Scalar)
}

fn shape(extents: &[Extent]) -> Dimensionality {
    Dimensionality::Array(extents.to_vec())
}

fn named(name: &str) -> Extent {
    Extent::Named(name.to_string())
}

fn entry(
    description: &str,
    dimensionality: Dimensionality,
    value_type: &str,
    units: Option<&str>,
    calculation: &[&str],
    property: Option<&str>,
) -> PropertyMetadata {
    PropertyMetadata {
        description: description.to_string(),
        dimensionality,
        value_type: value_type.to_string(),
        units: units.map(str::to_string),
        calculation: calculation.iter().map(|s| s.to_string()).collect(),
        property: property.map(str::to_string),
    }
}

fn build_standard() -> PropertyTable {
    let n_atoms = named("natoms");
    let mut table = PropertyTable::default();
    let mut add = |key: &str, metadata: PropertyMetadata| table.insert(key, metadata);

    add("energy", entry("electronic energy", scalar(), "float", Some("E_h"), &[], None));
    add(
        "gradients",
        entry(
            "gradients on the atoms",
            shape(&[Extent::Fixed(3), named("n_atoms")]),
            "float",
            Some("E_h/bohr"),
            &[],
            None,
        ),
    );
    add("model", entry("The model string", scalar(), "string", None, &[], None));
    add(
        "total_energy",
        entry(
            "The total energy",
            scalar(),
            "float",
            Some("E_h"),
            ENERGY_AND_OPT,
            Some("total energy#DFTB+#{model}"),
        ),
    );
    add(
        "energy_per_formula_unit",
        entry(
            "The energy per empirical formula unit",
            scalar(),
            "float",
            Some("E_h"),
            ENERGY_AND_OPT,
            Some("total energy per formula unit#DFTB+#{model}"),
        ),
    );
    add(
        "energy of formation",
        entry(
            "The energy of formation",
            scalar(),
            "float",
            Some("kJ/mol"),
            ENERGY_AND_OPT,
            Some("energy of formation#DFTB+#{model}"),
        ),
    );
    add(
        "fermi_level",
        entry(
            "The Fermi level",
            scalar(),
            "float",
            Some("E_h"),
            ENERGY_AND_OPT,
            Some("Fermi level#DFTB+#{model}"),
        ),
    );
    add("RMSD", entry("RMSD with H removed", scalar(), "float", Some("Å"), OPT_ONLY, None));
    add(
        "displaced atom",
        entry("Atom index with largest displacement", scalar(), "int", Some(""), OPT_ONLY, None),
    );
    add(
        "maximum displacement",
        entry("Maximum displacement of an atom", scalar(), "float", Some("Å"), OPT_ONLY, None),
    );
    add(
        "RMSD with H",
        entry("RMSD including H atoms", scalar(), "float", Some("Å"), OPT_ONLY, None),
    );
    add(
        "displaced atom with H",
        entry(
            "Atom index with largest displacement, including H",
            scalar(),
            "int",
            Some(""),
            OPT_ONLY,
            None,
        ),
    );
    add(
        "maximum displacement with H",
        entry(
            "Maximum displacement of an atom, including H",
            scalar(),
            "float",
            Some("Å"),
            OPT_ONLY,
            None,
        ),
    );
    add(
        "number_of_electrons",
        entry(
            "The number of electrons",
            shape(&[Extent::Fixed(2)]),
            "float",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    for (key, description) in [
        ("mermin_energy", "The Mermin energy"),
        ("extrapolated0_energy", "The energy extrapolated to no smearing"),
        ("forcerelated_energy", "The force-related energy"),
    ] {
        add(key, entry(description, scalar(), "float", Some("E_h"), ENERGY_AND_OPT, None));
    }
    for (key, description) in [
        ("dipole_moments", "The dipole moments of the system"),
        ("scaled_dipole", "The scaled dipole moments of the system"),
    ] {
        add(
            key,
            entry(
                description,
                shape(&[Extent::Fixed(3), named("nspins")]),
                "float",
                None,
                ENERGY_AND_OPT,
                None,
            ),
        );
    }
    add(
        "eigenvalues",
        entry(
            "The eigenvalues",
            shape(&[named("norbitals")]),
            "float",
            Some("E_h"),
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "filling",
        entry(
            "The orbital occupancy",
            shape(&[named("norbitals")]),
            "float",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "orbital_charges",
        entry(
            "The orbital charges",
            shape(&[n_atoms.clone(), n_atoms.clone()]),
            "float",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "gross_atomic_charges",
        entry(
            "The charges on the atoms",
            shape(&[n_atoms.clone()]),
            "float",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "gross_atomic_spins",
        entry(
            "The spins on the atoms",
            shape(&[n_atoms.clone()]),
            "float",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "atomic_dipole_moment",
        entry(
            "The dipole moments of the atoms",
            shape(&[Extent::Fixed(3), n_atoms.clone()]),
            "float",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "forces",
        entry(
            "The forces on the atoms",
            shape(&[Extent::Fixed(3), n_atoms]),
            "float",
            Some("E_h/bohr"),
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "stress",
        entry(
            "The stress",
            shape(&[Extent::Fixed(3), Extent::Fixed(3)]),
            "float",
            Some("Å^3"),
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "#_primitive_cells",
        entry(
            "The number of primitive cells in the unit cell",
            scalar(),
            "integer",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "Z",
        entry(
            "The number of empirical formula units in the system",
            scalar(),
            "integer",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "formula",
        entry("The chemical formula of the system", scalar(), "string", None, ENERGY_AND_OPT, None),
    );
    add(
        "empirical_formula",
        entry(
            "The empirical formula of the system",
            scalar(),
            "string",
            None,
            ENERGY_AND_OPT,
            None,
        ),
    );
    add(
        "cell_volume",
        entry(
            "The volume of the unit cell",
            scalar(),
            "float",
            Some("Å^3"),
            ENERGY_AND_OPT,
            Some("unit cell volume"),
        ),
    );
    table
}

lazy_static! {
    static ref STANDARD_PROPERTIES: PropertyTable = build_standard();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_units() {
        let table = PropertyTable::standard();
        assert_eq!(table.units("total_energy"), Some("E_h"));
        assert_eq!(table.units("forces"), Some("E_h/bohr"));
        assert_eq!(table.units("energy of formation"), Some("kJ/mol"));
        assert_eq!(table.units("gross_atomic_charges"), None);
        assert!(!table.contains("no_such_property"));
    }

    #[test]
    fn test_from_json() {
        let table = PropertyTable::from_json(
            r#"{
                "total_energy": {"description": "E", "dimensionality": "scalar", "type": "float", "units": "eV"},
                "forces": {"description": "F", "dimensionality": [3, "natoms"], "type": "float"}
            }"#,
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.units("total_energy"), Some("eV"));
        assert_eq!(
            table.get("forces").unwrap().dimensionality,
            Dimensionality::Array(vec![Extent::Fixed(3), Extent::Named("natoms".to_string())])
        );
    }
}
