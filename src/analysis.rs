//! Post-processing of finished DFTB+ runs.
//!
//! After a run the results map is enriched with derived quantities and a few
//! tables are written next to the DFTB+ output:
//!
//! - `detailed.out` supplies the final SCC error and, for optimizations, the
//!   number of steps and the last change in energy
//! - the structure supplies the formula, the number of formula units and,
//!   with reference energies, the energy of formation
//! - `atom_properties.csv` lists the atomic charges (and spins)
//! - `DOS.csv` and `BandStructure.csv` collect the output of `dp_dos` and
//!   `dp_bands`, shifted so the Fermi level is zero
//!
//! The assembly of the DOS and band tables is kept separate from running the
//! tools so it can be used on files produced elsewhere.

use crate::config::{HARTREE_TO_EV, HARTREE_TO_KJ_PER_MOL};
use crate::geometry::{Displacement, Structure};
use crate::io::{self, read_data_table, DataTable, IoError};
use crate::qm_interface::{CompanionTool, QMError};
use crate::results::{ResultMap, ResultValue};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised during post-processing.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// File system or I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A data file was malformed
    #[error(transparent)]
    Format(#[from] IoError),
    /// A companion tool failed
    #[error(transparent)]
    Tool(#[from] QMError),
    /// The data files disagree with each other or with the calculation
    #[error("Inconsistent data: {0}")]
    Inconsistent(String),
}

type Result<T> = std::result::Result<T, AnalysisError>;

lazy_static! {
    static ref OPTIMIZATION_STEP: Regex =
        Regex::new(r"Geometry optimization step:\s+(\d+)").unwrap();
    static ref PDOS_FILE: Regex = Regex::new(r"^pdos_([A-Za-z]+)\.(\d+)\.out$").unwrap();
}

/// Values read from `detailed.out`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetailedOutput {
    /// Final SCC error
    pub scc_error: Option<f64>,
    /// Last geometry optimization step
    pub optimization_steps: Option<usize>,
    /// Last change of the electronic energy, E_h
    pub last_energy_change: Option<f64>,
}

fn token(line: Option<&&str>, index: usize) -> Option<f64> {
    line.and_then(|l| l.split_whitespace().nth(index))
        .and_then(|t| t.parse().ok())
}

/// Scans the text of `detailed.out`. Later occurrences win.
pub fn parse_detailed_output(text: &str) -> DetailedOutput {
    let lines: Vec<&str> = text.lines().collect();
    let mut output = DetailedOutput::default();
    for (i, line) in lines.iter().enumerate() {
        if line.contains("SCC error") {
            if let Some(value) = token(lines.get(i + 1), 3) {
                output.scc_error = Some(value);
            }
        }
        if let Some(captures) = OPTIMIZATION_STEP.captures(line) {
            output.optimization_steps = captures[1].parse().ok();
        }
        if line.contains("Diff electronic") {
            if let Some(value) = token(lines.get(i + 1), 2) {
                output.last_energy_change = Some(value);
            }
        }
    }
    output
}

/// One line of a printed summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// What is reported
    pub property: String,
    /// The formatted value
    pub value: String,
    /// Units, possibly empty
    pub units: String,
}

impl SummaryRow {
    fn new(property: &str, value: String, units: &str) -> Self {
        Self {
            property: property.to_string(),
            value,
            units: units.to_string(),
        }
    }
}

/// A printable property/value/units table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// Rows in order
    pub rows: Vec<SummaryRow>,
}

impl Summary {
    /// Adds a row.
    pub fn push(&mut self, property: &str, value: String, units: &str) {
        self.rows.push(SummaryRow::new(property, value, units));
    }

    /// True if a row for `property` exists.
    pub fn contains(&self, property: &str) -> bool {
        self.rows.iter().any(|row| row.property == property)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wp = "Property".len();
        let mut wv = "Value".len();
        for row in &self.rows {
            wp = wp.max(row.property.chars().count());
            wv = wv.max(row.value.chars().count());
        }
        writeln!(f, "{:^wp$}  {:>wv$}  Units", "Property", "Value")?;
        for row in &self.rows {
            writeln!(f, "{:<wp$}  {:>wv$}  {}", row.property, row.value, row.units)?;
        }
        Ok(())
    }
}

/// Adds the quantities derived from the structure to `results`.
///
/// Inserts the formula, empirical formula, Z, the energy per formula unit
/// and, when `references` covers every element, the energy of formation in
/// kJ/mol. Periodic systems also get the cell volume and the number of
/// primitive cells, which is always 1 since the cell is used as given.
pub fn add_energy_properties(
    results: &mut ResultMap,
    structure: &Structure,
    references: Option<&BTreeMap<String, f64>>,
    detailed: &DetailedOutput,
) -> Summary {
    let mut summary = Summary::default();
    let total_energy = results.get_real("total_energy");
    if let Some(energy) = total_energy {
        summary.push("Total energy", format!("{:.6}", energy), "E_h");
    }

    let z_cell = 1.0;
    if let Some(volume) = structure.cell_volume() {
        results.insert("#_primitive_cells", ResultValue::Real(z_cell));
        results.insert_with_units("cell_volume", ResultValue::Real(volume), "Å^3");
        summary.push("Z", format!("{:.0}", z_cell), "");
    }
    if let Some(error) = detailed.scc_error {
        summary.push("SCC error", format!("{:.6}", error), "");
    }

    let formula = structure.formula();
    results.insert("formula", ResultValue::Text(formula.formula.clone()));
    results.insert("empirical_formula", ResultValue::Text(formula.empirical.clone()));
    results.insert("Z", ResultValue::Real(formula.z as f64));
    summary.push("Formula", formula.formula.clone(), "");

    let Some(energy) = total_energy else {
        return summary;
    };
    results.insert_with_units(
        "energy_per_formula_unit",
        ResultValue::Real(energy * z_cell / formula.z as f64),
        "E_h",
    );

    match references.and_then(|r| structure.reference_energy(r)) {
        Some(reference) => {
            let formation = (energy - reference) * HARTREE_TO_KJ_PER_MOL * z_cell;
            let label = if structure.lattice.is_some() {
                "Formation energy per cell"
            } else {
                "Formation energy"
            };
            summary.push(label, format!("{:.1}", formation), "kJ/mol");
            if formula.z != 1 {
                summary.push("Empirical formula", formula.empirical.clone(), "");
                summary.push(
                    "Formation energy",
                    format!("{:.1}", formation / formula.z as f64),
                    "kJ/mol",
                );
            }
            results.insert_with_units("energy of formation", ResultValue::Real(formation), "kJ/mol");
        }
        None => {
            info!("Could not calculate the formation energy because some reference energies are missing.");
        }
    }

    if let Some(fermi) = results.get_real("fermi_level") {
        summary.push("Fermi energy", format!("{:.2}", fermi * HARTREE_TO_EV), "eV");
    }
    summary
}

/// Adds the optimization statistics to `results` and the summary.
///
/// `displacements` holds the movement of the atoms without and with
/// hydrogen; either is absent for periodic systems or when nothing moved.
pub fn add_optimization_properties(
    results: &mut ResultMap,
    summary: &mut Summary,
    detailed: &DetailedOutput,
    displacements: (Option<Displacement>, Option<Displacement>),
) {
    if let Some(steps) = detailed.optimization_steps {
        summary.push("Optimization steps", steps.to_string(), "");
    }
    if let Some(change) = detailed.last_energy_change {
        summary.push("Last energy change", format!("{:.6}", change), "E_h");
    }
    let (heavy, all) = displacements;
    for (suffix, displacement) in [("", heavy), (" with H", all)] {
        let Some(d) = displacement else {
            continue;
        };
        results.insert_with_units(&format!("RMSD{}", suffix), ResultValue::Real(d.rmsd), "Å");
        results.insert_with_units(
            &format!("maximum displacement{}", suffix),
            ResultValue::Real(d.maximum),
            "Å",
        );
        results.insert_with_units(
            &format!("displaced atom{}", suffix),
            ResultValue::Real((d.atom + 1) as f64),
            "",
        );
        summary.push(&format!("RMSD{}", suffix), format!("{:.2}", d.rmsd), "Å");
        summary.push(
            &format!("Largest displacement{}", suffix),
            format!("{:.2}", d.maximum),
            "Å",
        );
    }
}

/// Charges and spins of the atoms after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct AtomProperties {
    /// Gross charge of each atom
    pub charges: Vec<f64>,
    /// Gross spin of each atom, for spin-polarised runs
    pub spins: Option<Vec<f64>>,
}

/// Picks one value per atom out of a 1-D or 2-D array.
///
/// For 2-D data the first component is taken along whichever axis has
/// `n_atoms` entries.
fn per_atom(value: &ResultValue, n_atoms: usize) -> Option<Vec<f64>> {
    let array = value.as_real_array()?;
    let flat: Vec<f64> = array.flatten().into_iter().copied().collect();
    match array.shape().as_slice() {
        [n] if *n == n_atoms => Some(flat),
        [_, n] if *n == n_atoms => Some(flat[..n_atoms].to_vec()),
        [n, width] if *n == n_atoms => Some(flat.iter().step_by(*width).copied().collect()),
        _ => None,
    }
}

/// Reads the atomic charges and spins from `results`.
pub fn atom_properties(results: &ResultMap, n_atoms: usize) -> Option<AtomProperties> {
    let charges = per_atom(results.get("gross_atomic_charges")?, n_atoms)?;
    let spins = results
        .get("gross_atomic_spins")
        .and_then(|value| per_atom(value, n_atoms));
    Some(AtomProperties { charges, spins })
}

impl AtomProperties {
    /// The header and rows of `atom_properties.csv`.
    ///
    /// Charges get three decimals alongside spins and two without them.
    pub fn table(&self, structure: &Structure) -> (Vec<&'static str>, Vec<Vec<String>>) {
        let mut rows = Vec::with_capacity(self.charges.len());
        match &self.spins {
            Some(spins) => {
                for (i, ((element, q), s)) in structure
                    .elements
                    .iter()
                    .zip(&self.charges)
                    .zip(spins)
                    .enumerate()
                {
                    rows.push(vec![
                        (i + 1).to_string(),
                        element.clone(),
                        format!("{:.3}", q),
                        format!("{:.3}", s),
                    ]);
                }
                (vec!["Atom", "Element", "Charge", "Spin"], rows)
            }
            None => {
                for (i, (element, q)) in structure.elements.iter().zip(&self.charges).enumerate() {
                    rows.push(vec![(i + 1).to_string(), element.clone(), format!("{:.2}", q)]);
                }
                (vec!["Atom", "Element", "Charge"], rows)
            }
        }
    }

    /// Writes `atom_properties.csv` and returns the table as text, or
    /// `None` if the structure has more than `max_atoms_to_print` atoms.
    pub fn write(&self, structure: &Structure, path: &Path, max_atoms_to_print: usize) -> Result<Option<String>> {
        let (header, rows) = self.table(structure);
        io::write_csv(path, &header, &rows)?;
        if structure.n_atoms() > max_atoms_to_print {
            return Ok(None);
        }
        let mut text = header.join("  ");
        text.push('\n');
        for row in &rows {
            text.push_str(&row.join("  "));
            text.push('\n');
        }
        Ok(Some(text))
    }

    /// Stores the charges and spins on `structure` for later steps.
    pub fn apply_to(&self, structure: &mut Structure) {
        structure.atom_charges = Some(self.charges.clone());
        if let Some(spins) = &self.spins {
            structure.atom_spins = Some(spins.clone());
        }
    }
}

/// A table with an energy or k-point index and named columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabelledTable {
    /// Name of the index column
    pub index_name: String,
    /// Index values
    pub index: Vec<f64>,
    /// Column names and values
    pub columns: Vec<(String, Vec<f64>)>,
}

impl LabelledTable {
    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Column names, index first.
    pub fn header(&self) -> Vec<String> {
        std::iter::once(self.index_name.clone())
            .chain(self.columns.iter().map(|(name, _)| name.clone()))
            .collect()
    }

    fn keep_rows(&mut self, keep: &[bool]) {
        let filter = |values: &Vec<f64>| -> Vec<f64> {
            values
                .iter()
                .zip(keep)
                .filter(|(_, k)| **k)
                .map(|(v, _)| *v)
                .collect()
        };
        self.index = filter(&self.index);
        for (_, values) in self.columns.iter_mut() {
            *values = filter(values);
        }
    }
}

/// One `pdos_<element>.<shell>.out` file converted to a table.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialDos {
    /// Element the region covers
    pub element: String,
    /// Shell number, 1 for s
    pub shell: usize,
    /// Output of `dp_dos -w`
    pub table: DataTable,
}

fn shell_name(shell: usize) -> Result<&'static str> {
    ["s", "p", "d", "f"]
        .get(shell.wrapping_sub(1))
        .copied()
        .ok_or_else(|| AnalysisError::Inconsistent(format!("Unknown shell number {}", shell)))
}

fn check_columns(table: &DataTable, spin_polarized: bool, what: &str) -> Result<()> {
    match (table.n_columns(), spin_polarized) {
        (1, false) | (3, true) => Ok(()),
        (1, true) => Err(AnalysisError::Inconsistent(format!(
            "Calculation is spin-polarized but {} is not.",
            what
        ))),
        (3, false) => Err(AnalysisError::Inconsistent(format!(
            "Calculation is not spin-polarized but {} is.",
            what
        ))),
        (n, _) => Err(AnalysisError::Inconsistent(format!(
            "The {} has {} columns of data.",
            what, n
        ))),
    }
}

/// Combines the total and partial DOS into one table.
///
/// Each partial DOS adds a column per shell and each element a summed
/// column, with up and down columns for spin-polarised runs. Energies present
/// in only some of the tables are dropped. The energies are shifted by
/// `fermi_ev` so the Fermi level is at zero.
pub fn assemble_dos(
    total: &DataTable,
    partials: &[PartialDos],
    fermi_ev: f64,
    spin_polarized: bool,
) -> Result<LabelledTable> {
    check_columns(total, spin_polarized, "total DOS")?;
    let mut dos = LabelledTable {
        index_name: "E".to_string(),
        index: total.index(),
        columns: Vec::new(),
    };
    dos.columns.push(("Total".to_string(), total.column(0)));
    if spin_polarized {
        dos.columns.push(("Total ↑".to_string(), total.column(1)));
        dos.columns.push(("Total ↓".to_string(), total.column(2)));
    }

    let mut by_element: BTreeMap<&str, Vec<&PartialDos>> = BTreeMap::new();
    for partial in partials {
        by_element.entry(partial.element.as_str()).or_default().push(partial);
    }

    for (element, mut shells) in by_element {
        shells.sort_by_key(|p| p.shell);
        let mut sums: Vec<Vec<f64>> = Vec::new();
        for partial in shells {
            let label = format!("{}_{}", element, shell_name(partial.shell)?);
            check_columns(&partial.table, spin_polarized, &format!("partial DOS {}", label))?;

            let energies = partial.table.index();
            let keep: Vec<bool> = dos.index.iter().map(|e| energies.contains(e)).collect();
            if keep.iter().any(|k| !k) {
                debug!("Dropping {} energies not in the partial DOS {}", keep.iter().filter(|k| !**k).count(), label);
                dos.keep_rows(&keep);
                for sum in sums.iter_mut() {
                    *sum = sum.iter().zip(&keep).filter(|(_, k)| **k).map(|(v, _)| *v).collect();
                }
            }
            let rows: Vec<usize> = dos
                .index
                .iter()
                .map(|e| energies.iter().position(|x| x == e))
                .collect::<Option<Vec<usize>>>()
                .ok_or_else(|| {
                    AnalysisError::Inconsistent(format!(
                        "The energy values for partial DOS {} are different!",
                        label
                    ))
                })?;

            let components: Vec<(String, usize)> = if spin_polarized {
                vec![(format!("{} ↑", label), 1), (format!("{} ↓", label), 2)]
            } else {
                vec![(label.clone(), 0)]
            };
            if sums.is_empty() {
                sums = vec![vec![0.0; rows.len()]; components.len()];
            }
            for (k, (name, column)) in components.into_iter().enumerate() {
                let values = partial.table.column(column);
                let selected: Vec<f64> = rows.iter().map(|&r| values[r]).collect();
                for (sum, v) in sums[k].iter_mut().zip(&selected) {
                    *sum += v;
                }
                dos.columns.push((name, selected));
            }
        }
        let names: Vec<String> = if spin_polarized {
            vec![format!("{} ↑", element), format!("{} ↓", element)]
        } else {
            vec![element.to_string()]
        };
        for (name, sum) in names.into_iter().zip(sums) {
            dos.columns.push((name, sum));
        }
    }

    for energy in dos.index.iter_mut() {
        *energy -= fermi_ev;
    }
    Ok(dos)
}

/// Runs `dp_dos` on `band.out` and the projected DOS files in `directory`,
/// assembles the result and writes `DOS.csv`.
pub fn run_dos(
    directory: &Path,
    dp_dos: &CompanionTool,
    fermi_ev: f64,
    spin_polarized: bool,
) -> Result<LabelledTable> {
    dp_dos.run(&["band.out", "dos_total.dat"], directory)?;
    let total = read_data_table(&directory.join("dos_total.dat"))?;

    let mut names: Vec<String> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| PDOS_FILE.is_match(name))
        .collect();
    names.sort();

    let mut partials = Vec::new();
    for name in names {
        let Some(captures) = PDOS_FILE.captures(&name) else {
            continue;
        };
        let element = captures[1].to_string();
        let shell: usize = captures[2]
            .parse()
            .map_err(|_| AnalysisError::Inconsistent(format!("Bad shell number in {}", name)))?;
        let output = name.replace(".out", ".dat");
        dp_dos.run(&["-w", &name, &output], directory)?;
        partials.push(PartialDos {
            element,
            shell,
            table: read_data_table(&directory.join(&output))?,
        });
    }

    let dos = assemble_dos(&total, &partials, fermi_ev, spin_polarized)?;
    write_table(&dos, &directory.join("DOS.csv"))?;
    Ok(dos)
}

fn write_table(table: &LabelledTable, path: &Path) -> Result<()> {
    let rows: Vec<Vec<f64>> = table
        .index
        .iter()
        .enumerate()
        .map(|(i, e)| {
            std::iter::once(*e)
                .chain(table.columns.iter().map(|(_, values)| values[i]))
                .collect()
        })
        .collect();
    io::write_csv(path, &table.header(), &rows)?;
    Ok(())
}

/// A band structure ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct BandTable {
    /// The bands, indexed by k-point number
    pub bands: LabelledTable,
    /// High-symmetry label of each k-point, empty elsewhere
    pub labels: Vec<String>,
    /// Distance along the path of each k-point
    pub points: Vec<f64>,
}

impl BandTable {
    /// The header and rows of `BandStructure.csv`.
    pub fn rows(&self) -> (Vec<String>, Vec<Vec<String>>) {
        let mut header = vec![self.bands.index_name.clone(), "labels".to_string(), "points".to_string()];
        header.extend(self.bands.columns.iter().map(|(name, _)| name.clone()));
        let rows = self
            .bands
            .index
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let mut row = vec![
                    k.to_string(),
                    self.labels[i].clone(),
                    self.points.get(i).map(|p| p.to_string()).unwrap_or_default(),
                ];
                row.extend(self.bands.columns.iter().map(|(_, values)| values[i].to_string()));
                row
            })
            .collect();
        (header, rows)
    }
}

/// Builds the band table from the `dp_bands` output.
///
/// `tables` holds `band_tot.dat`, or `band_s1.dat` and `band_s2.dat` for
/// spin-polarised runs. `labels` are the 1-based k-point numbers of the
/// high-symmetry points.
pub fn assemble_bands(
    tables: &[DataTable],
    fermi_ev: f64,
    labels: &[(usize, String)],
    points: &[f64],
) -> Result<BandTable> {
    let first = tables
        .first()
        .ok_or_else(|| AnalysisError::Inconsistent("No band data".to_string()))?;
    let mut bands = LabelledTable {
        index_name: "k".to_string(),
        index: first.index(),
        columns: Vec::new(),
    };
    let prefixes: &[&str] = match tables.len() {
        1 => &[""],
        2 => &["↑ ", "↓ "],
        n => {
            return Err(AnalysisError::Inconsistent(format!(
                "Expected one or two band files, got {}",
                n
            )))
        }
    };
    for (table, prefix) in tables.iter().zip(prefixes) {
        if table.rows.len() != first.rows.len() {
            return Err(AnalysisError::Inconsistent(
                "The spin channels have different numbers of k-points".to_string(),
            ));
        }
        for i in 0..table.n_columns() {
            let values = table.column(i).iter().map(|e| e - fermi_ev).collect();
            bands.columns.push((format!("{}{}", prefix, i + 1), values));
        }
    }

    let n_rows = bands.index.len();
    let mut names = vec![String::new(); n_rows];
    for (point, label) in labels {
        if let Some(slot) = point.checked_sub(1).and_then(|i| names.get_mut(i)) {
            *slot = label.clone();
        }
    }
    Ok(BandTable {
        bands,
        labels: names,
        points: points.to_vec(),
    })
}

/// Runs `dp_bands` on `band.out` in `directory`, assembles the result and
/// writes `BandStructure.csv`.
pub fn run_bands(
    directory: &Path,
    dp_bands: &CompanionTool,
    fermi_ev: f64,
    spin_polarized: bool,
    labels: &[(usize, String)],
    points: &[f64],
) -> Result<BandTable> {
    let files: &[&str] = if spin_polarized {
        dp_bands.run(&["-s", "band.out", "band"], directory)?;
        &["band_s1.dat", "band_s2.dat"]
    } else {
        dp_bands.run(&["band.out", "band"], directory)?;
        &["band_tot.dat"]
    };
    let tables = files
        .iter()
        .map(|name| read_data_table(&directory.join(name)))
        .collect::<std::result::Result<Vec<_>, IoError>>()?;
    let table = assemble_bands(&tables, fermi_ev, labels, points)?;
    let (header, rows) = table.rows();
    io::write_csv(&directory.join("BandStructure.csv"), &header, &rows)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::parse_data_table;
    use crate::reshape::reshape;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    const DETAILED: &str = "\
Total Energy:                      -4.0779379251 H         -110.9664 eV
 iSCC Total electronic   Diff electronic      SCC error
   12   -0.41218659E+01    0.12345678E-07    0.45678901E-06
Geometry optimization step: 7
";

    #[test]
    fn test_parse_detailed_output() {
        let output = parse_detailed_output(DETAILED);
        assert_eq!(output.scc_error, Some(0.45678901e-6));
        assert_eq!(output.optimization_steps, Some(7));
        assert_eq!(output.last_energy_change, Some(0.12345678e-7));
        assert_eq!(parse_detailed_output(""), DetailedOutput::default());
    }

    fn water() -> Structure {
        Structure::molecule(
            vec!["O".into(), "H".into(), "H".into()],
            vec![[0.0, 0.0, 0.0], [0.0, 0.757, 0.587], [0.0, -0.757, 0.587]],
        )
    }

    #[test]
    fn test_energy_properties() {
        let mut results = ResultMap::new();
        results.insert("total_energy", ResultValue::Real(-4.0));
        results.insert("fermi_level", ResultValue::Real(-0.2));
        let mut references = BTreeMap::new();
        references.insert("O".to_string(), -3.0);
        references.insert("H".to_string(), -0.4);

        let summary = add_energy_properties(&mut results, &water(), Some(&references), &DetailedOutput::default());
        assert_eq!(results.get_text("formula"), Some("H2O"));
        assert_eq!(results.get_real("Z"), Some(1.0));
        assert_eq!(results.get_real("energy_per_formula_unit"), Some(-4.0));
        assert_relative_eq!(
            results.get_real("energy of formation").unwrap(),
            -0.2 * HARTREE_TO_KJ_PER_MOL,
            epsilon = 1e-9
        );
        assert_eq!(results.units("energy of formation"), Some("kJ/mol"));
        assert!(summary.contains("Fermi energy"));
        assert!(!results.contains_key("cell_volume"));
    }

    #[test]
    fn test_formation_energy_needs_every_reference() {
        let mut results = ResultMap::new();
        results.insert("total_energy", ResultValue::Real(-4.0));
        let mut references = BTreeMap::new();
        references.insert("O".to_string(), -3.0);
        add_energy_properties(&mut results, &water(), Some(&references), &DetailedOutput::default());
        assert!(!results.contains_key("energy of formation"));
    }

    #[test]
    fn test_atom_properties_table() {
        let mut results = ResultMap::new();
        results.insert(
            "gross_atomic_charges",
            ResultValue::RealArray(reshape(vec![-0.6, 0.3, 0.3], &[3]).unwrap()),
        );
        let properties = atom_properties(&results, 3).unwrap();
        let (header, rows) = properties.table(&water());
        assert_eq!(header, vec!["Atom", "Element", "Charge"]);
        assert_eq!(rows[0], vec!["1", "O", "-0.60"]);

        results.insert(
            "gross_atomic_spins",
            ResultValue::RealArray(reshape(vec![0.5, 0.25, 0.25], &[1, 3]).unwrap()),
        );
        let properties = atom_properties(&results, 3).unwrap();
        let (header, rows) = properties.table(&water());
        assert_eq!(header.len(), 4);
        assert_eq!(rows[1], vec!["2", "H", "0.300", "0.250"]);

        let mut structure = water();
        properties.apply_to(&mut structure);
        assert_eq!(structure.atom_spins, Some(vec![0.5, 0.25, 0.25]));
    }

    #[test]
    fn test_atom_properties_written_and_printed() {
        let temp = TempDir::new().unwrap();
        let properties = AtomProperties {
            charges: vec![-0.6, 0.3, 0.3],
            spins: None,
        };
        let path = temp.path().join("atom_properties.csv");
        let text = properties.write(&water(), &path, 25).unwrap();
        assert!(text.unwrap().starts_with("Atom  Element  Charge\n1  O  -0.60\n"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "Atom,Element,Charge\n1,O,-0.60\n2,H,0.30\n3,H,0.30\n"
        );
        assert_eq!(properties.write(&water(), &path, 2).unwrap(), None);
    }

    fn table(text: &str) -> DataTable {
        parse_data_table(text).unwrap()
    }

    #[test]
    fn test_assemble_dos() {
        let total = table("! total\n-1.0 1.0\n0.0 2.0\n1.0 3.0\n");
        let partials = vec![
            PartialDos {
                element: "Si".to_string(),
                shell: 2,
                table: table("-1.0 0.25\n0.0 0.5\n1.0 1.0\n"),
            },
            PartialDos {
                element: "Si".to_string(),
                shell: 1,
                table: table("-1.0 0.75\n0.0 1.5\n1.0 2.0\n"),
            },
        ];
        let dos = assemble_dos(&total, &partials, 0.5, false).unwrap();
        assert_eq!(dos.header(), vec!["E", "Total", "Si_s", "Si_p", "Si"]);
        assert_eq!(dos.index, vec![-1.5, -0.5, 0.5]);
        assert_eq!(dos.column("Si"), Some(&[1.0, 2.0, 3.0][..]));
    }

    #[test]
    fn test_assemble_dos_drops_unshared_energies() {
        let total = table("-1.0 1.0 0.5 0.5\n0.0 2.0 1.0 1.0\n1.0 3.0 1.5 1.5\n");
        let partials = vec![PartialDos {
            element: "Fe".to_string(),
            shell: 3,
            table: table("0.0 1.0 0.6 0.4\n1.0 2.0 1.2 0.8\n"),
        }];
        let dos = assemble_dos(&total, &partials, 0.0, true).unwrap();
        assert_eq!(dos.index, vec![0.0, 1.0]);
        assert_eq!(
            dos.header(),
            vec!["E", "Total", "Total ↑", "Total ↓", "Fe_d ↑", "Fe_d ↓", "Fe ↑", "Fe ↓"]
        );
        assert_eq!(dos.column("Total"), Some(&[2.0, 3.0][..]));
        assert_eq!(dos.column("Fe ↓"), Some(&[0.4, 0.8][..]));
    }

    #[test]
    fn test_assemble_dos_checks_spin() {
        let total = table("0.0 1.0\n");
        assert!(matches!(
            assemble_dos(&total, &[], 0.0, true),
            Err(AnalysisError::Inconsistent(message)) if message.contains("total DOS is not")
        ));
    }

    #[test]
    fn test_assemble_bands() {
        let up = table("1 -5.0 1.0\n2 -4.0 2.0\n3 -3.0 3.0\n");
        let down = table("1 -5.5 1.5\n2 -4.5 2.5\n3 -3.5 3.5\n");
        let labels = vec![(1, "G".to_string()), (3, "X".to_string())];
        let bands = assemble_bands(&[up, down], 1.0, &labels, &[0.0, 0.5, 1.0]).unwrap();
        assert_eq!(bands.labels, vec!["G", "", "X"]);
        let (header, rows) = bands.rows();
        assert_eq!(header, vec!["k", "labels", "points", "↑ 1", "↑ 2", "↓ 1", "↓ 2"]);
        assert_eq!(rows[2], vec!["3", "X", "1", "-4", "2", "-4.5", "2.5"]);
    }
}
