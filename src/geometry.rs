//! Structures handed to DFTB+.
//!
//! A [`Structure`] is either a molecule (periodicity 0) or a 3-D periodic
//! crystal (periodicity 3). Coordinates are always stored as Cartesian
//! positions in Ångström; lattice vectors are the rows of the cell matrix.
//!
//! The module also renders the DFTB+ `Geometry` block and computes the
//! bookkeeping quantities reported after a calculation: chemical formula,
//! empirical formula and Z, reference energy sums, and the displacement
//! between two structures.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use thiserror::Error;

/// Errors raised for inconsistent structures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// Per-atom data does not match the number of atoms
    #[error("{what} has {found} entries but the structure has {expected} atoms")]
    AtomCount {
        /// Which per-atom array is wrong
        what: String,
        /// Number of atoms
        expected: usize,
        /// Entries found
        found: usize,
    },
    /// The lattice vectors are linearly dependent
    #[error("The lattice vectors are singular")]
    SingularLattice,
    /// The structure has no atoms
    #[error("The structure has no atoms")]
    Empty,
    /// An operation that needs a cell was used on a molecule
    #[error("The structure is not periodic")]
    NotPeriodic,
}

type Result<T> = std::result::Result<T, GeometryError>;

/// A molecule or periodic crystal.
///
/// # Examples
///
/// ```
/// use dftbstep::geometry::Structure;
///
/// let water = Structure::molecule(
///     vec!["O".into(), "H".into(), "H".into()],
///     vec![[0.0, 0.0, 0.0], [0.757, 0.586, 0.0], [-0.757, 0.586, 0.0]],
/// );
/// assert_eq!(water.n_atoms(), 3);
/// assert_eq!(water.periodicity(), 0);
/// assert_eq!(water.type_names(), vec!["H", "O"]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// Optional name, used only for reporting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Element symbol of each atom
    pub elements: Vec<String>,
    /// Cartesian coordinates in Ångström
    pub coordinates: Vec<[f64; 3]>,
    /// Lattice vectors in Ångström, one per row; absent for molecules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice: Option<[[f64; 3]; 3]>,
    /// Total charge
    #[serde(default)]
    pub charge: i64,
    /// Spin multiplicity, 2S+1
    #[serde(default = "default_multiplicity")]
    pub multiplicity: u32,
    /// Partial charge on each atom, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom_charges: Option<Vec<f64>>,
    /// Spin on each atom, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom_spins: Option<Vec<f64>>,
}

fn default_multiplicity() -> u32 {
    1
}

/// Chemical formula, empirical formula and the number of formula units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Formula {
    /// Formula of the whole structure, e.g. `C2H6O`
    pub formula: String,
    /// Formula reduced by the greatest common divisor of the counts
    pub empirical: String,
    /// Number of empirical formula units
    pub z: usize,
}

/// How far atoms moved between two structures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Displacement {
    /// Root-mean-square displacement in Ångström
    pub rmsd: f64,
    /// Largest single-atom displacement in Ångström
    pub maximum: f64,
    /// Zero-based index of the atom that moved most
    pub atom: usize,
}

impl Structure {
    /// Creates a molecule with no charge and singlet multiplicity.
    pub fn molecule(elements: Vec<String>, coordinates: Vec<[f64; 3]>) -> Self {
        Self {
            name: None,
            elements,
            coordinates,
            lattice: None,
            charge: 0,
            multiplicity: 1,
            atom_charges: None,
            atom_spins: None,
        }
    }

    /// Creates a periodic structure from Cartesian coordinates.
    pub fn periodic(
        elements: Vec<String>,
        coordinates: Vec<[f64; 3]>,
        lattice: [[f64; 3]; 3],
    ) -> Self {
        Self {
            lattice: Some(lattice),
            ..Self::molecule(elements, coordinates)
        }
    }

    /// Creates a periodic structure from fractional coordinates.
    pub fn from_fractional(
        elements: Vec<String>,
        fractional: &[[f64; 3]],
        lattice: [[f64; 3]; 3],
    ) -> Self {
        let cell = matrix_from_rows(&lattice);
        let coordinates = fractional
            .iter()
            .map(|f| {
                let cartesian = cell.transpose() * Vector3::from(*f);
                [cartesian.x, cartesian.y, cartesian.z]
            })
            .collect();
        Self::periodic(elements, coordinates, lattice)
    }

    /// Checks that the per-atom arrays agree and the cell is usable.
    pub fn validate(&self) -> Result<()> {
        let n = self.n_atoms();
        if n == 0 {
            return Err(GeometryError::Empty);
        }
        let check = |what: &str, found: usize| {
            if found == n {
                Ok(())
            } else {
                Err(GeometryError::AtomCount {
                    what: what.to_string(),
                    expected: n,
                    found,
                })
            }
        };
        check("coordinates", self.coordinates.len())?;
        if let Some(charges) = &self.atom_charges {
            check("atom_charges", charges.len())?;
        }
        if let Some(spins) = &self.atom_spins {
            check("atom_spins", spins.len())?;
        }
        if let Some(cell) = self.cell_matrix() {
            if cell.determinant().abs() < 1e-8 {
                return Err(GeometryError::SingularLattice);
            }
        }
        Ok(())
    }

    /// Number of atoms.
    pub fn n_atoms(&self) -> usize {
        self.elements.len()
    }

    /// 0 for molecules, 3 for crystals.
    pub fn periodicity(&self) -> u8 {
        if self.lattice.is_some() {
            3
        } else {
            0
        }
    }

    /// Distinct element symbols in alphabetical order.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.elements.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// The cell matrix with lattice vectors as rows.
    pub fn cell_matrix(&self) -> Option<Matrix3<f64>> {
        self.lattice.as_ref().map(matrix_from_rows)
    }

    /// Volume of the cell in Å^3.
    pub fn cell_volume(&self) -> Option<f64> {
        self.cell_matrix().map(|cell| cell.determinant().abs())
    }

    /// Lengths of the reciprocal lattice vectors in 1/Å, including 2π.
    pub fn reciprocal_lengths(&self) -> Result<[f64; 3]> {
        let reciprocal = self.reciprocal_lattice()?;
        Ok([
            reciprocal.row(0).norm(),
            reciprocal.row(1).norm(),
            reciprocal.row(2).norm(),
        ])
    }

    /// Reciprocal lattice vectors as rows, including the 2π factor.
    pub fn reciprocal_lattice(&self) -> Result<Matrix3<f64>> {
        let cell = self.cell_matrix().ok_or(GeometryError::NotPeriodic)?;
        let inverse = cell.try_inverse().ok_or(GeometryError::SingularLattice)?;
        Ok(inverse.transpose() * (2.0 * PI))
    }

    /// Coordinates as fractions of the lattice vectors.
    pub fn fractional_coordinates(&self) -> Result<Vec<[f64; 3]>> {
        let cell = self.cell_matrix().ok_or(GeometryError::NotPeriodic)?;
        let to_fractional = cell
            .transpose()
            .try_inverse()
            .ok_or(GeometryError::SingularLattice)?;
        Ok(self
            .coordinates
            .iter()
            .map(|r| {
                let f = to_fractional * Vector3::from(*r);
                [f.x, f.y, f.z]
            })
            .collect())
    }

    /// Renders the DFTB+ `Geometry` block.
    ///
    /// Molecules use Cartesian coordinates; crystals use the lattice vectors
    /// and relative (fractional) coordinates.
    pub fn geometry_hsd(&self) -> Result<String> {
        let names = self.type_names();
        let type_index = |element: &str| names.iter().position(|n| *n == element).unwrap_or(0) + 1;

        let mut text = String::from("Geometry = {\n");
        text.push_str(&format!("    TypeNames = {{\"{}\"}}\n", names.join("\" \"")));

        match self.cell_matrix() {
            None => {
                text.push_str("    TypesAndCoordinates [Angstrom] = {\n");
                for (element, [x, y, z]) in self.elements.iter().zip(&self.coordinates) {
                    text.push_str(&format!(
                        "        {:>2} {:10.6} {:10.6} {:10.6}\n",
                        type_index(element.as_str()),
                        x,
                        y,
                        z
                    ));
                }
                text.push_str("    }\n");
            }
            Some(cell) => {
                text.push_str("    Periodic = Yes\n");
                text.push_str("    LatticeVectors [Angstrom] = {\n");
                for row in cell.row_iter() {
                    text.push_str(&format!(
                        "        {:15.9} {:15.9} {:15.9}\n",
                        row[0], row[1], row[2]
                    ));
                }
                text.push_str("    }\n");
                text.push_str("    TypesAndCoordinates [relative] = {\n");
                for (element, [x, y, z]) in self.elements.iter().zip(self.fractional_coordinates()?) {
                    text.push_str(&format!(
                        "        {:>2} {:15.9} {:15.9} {:15.9}\n",
                        type_index(element.as_str()),
                        x,
                        y,
                        z
                    ));
                }
                text.push_str("    }\n");
            }
        }
        text.push_str("}\n");
        Ok(text)
    }

    /// Chemical formula in Hill order, with the empirical formula and Z.
    pub fn formula(&self) -> Formula {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for element in &self.elements {
            *counts.entry(element.as_str()).or_insert(0) += 1;
        }
        let z = counts.values().copied().fold(0, gcd).max(1);

        let mut order: Vec<&str> = Vec::new();
        if counts.contains_key("C") {
            order.push("C");
            if counts.contains_key("H") {
                order.push("H");
            }
        }
        let rest: Vec<&str> = counts
            .keys()
            .copied()
            .filter(|e| !order.contains(e))
            .collect();
        order.extend(rest);

        let render = |divisor: usize| {
            order
                .iter()
                .map(|element| match counts[element] / divisor {
                    1 => element.to_string(),
                    n => format!("{}{}", element, n),
                })
                .collect::<String>()
        };

        Formula {
            formula: render(1),
            empirical: render(z),
            z,
        }
    }

    /// Sum of per-element reference energies, if every element has one.
    pub fn reference_energy(&self, references: &BTreeMap<String, f64>) -> Option<f64> {
        self.elements
            .iter()
            .map(|element| references.get(element).copied())
            .sum()
    }

    /// Atom-by-atom displacement from `other`, without any alignment.
    ///
    /// Hydrogen atoms are skipped unless `include_hydrogen` is set. Returns
    /// `None` if the structures differ in size or no atoms are compared.
    pub fn displacement_from(&self, other: &Structure, include_hydrogen: bool) -> Option<Displacement> {
        if self.n_atoms() != other.n_atoms() {
            return None;
        }
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut maximum = 0.0;
        let mut atom = 0;
        for (i, (a, b)) in self.coordinates.iter().zip(&other.coordinates).enumerate() {
            if !include_hydrogen && self.elements[i] == "H" {
                continue;
            }
            let distance = (Vector3::from(*a) - Vector3::from(*b)).norm();
            sum += distance * distance;
            count += 1;
            if distance > maximum {
                maximum = distance;
                atom = i;
            }
        }
        if count == 0 {
            return None;
        }
        Some(Displacement {
            rmsd: (sum / count as f64).sqrt(),
            maximum,
            atom,
        })
    }

    /// Per-atom charges adjusted so they sum exactly to the total charge.
    pub fn charges_summing_to_total(&self) -> Option<Vec<f64>> {
        let charges = self.atom_charges.as_ref()?;
        if charges.is_empty() {
            return None;
        }
        let delta = (self.charge as f64 - charges.iter().sum::<f64>()) / charges.len() as f64;
        Some(charges.iter().map(|q| q + delta).collect())
    }
}

fn matrix_from_rows(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::new(
        rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
        rows[2][1], rows[2][2],
    )
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
