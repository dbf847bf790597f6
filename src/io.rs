//! File formats read and written around a DFTB+ run.
//!
//! - `geom.out.gen`, the final structure of an optimization ([`parse_gen`])
//! - whitespace-separated data tables from `dp_dos` and `dp_bands`, where `!`
//!   starts a comment ([`parse_data_table`])
//! - CSV tables written for downstream tools ([`write_csv`])
//! - XYZ files for the final structure ([`write_xyz`])

use crate::geometry::Structure;
use serde::Serialize;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while reading or writing files.
#[derive(Error, Debug)]
pub enum IoError {
    /// Underlying file system error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The contents do not follow the expected format
    #[error("Format error: {0}")]
    Format(String),
    /// The file ended early
    #[error("Unexpected end of file: {0}")]
    UnexpectedEof(String),
}

type Result<T> = std::result::Result<T, IoError>;

/// How coordinates in a gen file are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinateSystem {
    /// Cartesian Ångström
    Cartesian,
    /// Fractions of the lattice vectors
    Fractional,
}

/// Contents of a DFTB+ gen file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenStructure {
    /// 0 for clusters, 3 for supercells
    pub periodicity: u8,
    /// Meaning of `coordinates`
    pub coordinate_system: CoordinateSystem,
    /// Element of each atom
    pub elements: Vec<String>,
    /// Coordinates of each atom
    pub coordinates: Vec<[f64; 3]>,
    /// Origin of the cell, for periodic structures
    pub origin: Option<[f64; 3]>,
    /// Lattice vectors as rows, for periodic structures
    pub lattice: Option<[[f64; 3]; 3]>,
}

impl GenStructure {
    /// Builds a [`Structure`] with these coordinates, keeping charge,
    /// multiplicity and name from `template`.
    pub fn to_structure(&self, template: &Structure) -> Structure {
        let mut structure = match (self.lattice, self.coordinate_system) {
            (Some(lattice), CoordinateSystem::Fractional) => {
                Structure::from_fractional(self.elements.clone(), &self.coordinates, lattice)
            }
            (Some(lattice), CoordinateSystem::Cartesian) => {
                Structure::periodic(self.elements.clone(), self.coordinates.clone(), lattice)
            }
            (None, _) => Structure::molecule(self.elements.clone(), self.coordinates.clone()),
        };
        structure.name = template.name.clone();
        structure.charge = template.charge;
        structure.multiplicity = template.multiplicity;
        structure
    }
}

fn parse_floats<const N: usize>(fields: &[&str], line: &str) -> Result<[f64; N]> {
    if fields.len() < N {
        return Err(IoError::Format(format!("Expected {} numbers in '{}'", N, line)));
    }
    let mut values = [0.0; N];
    for (value, field) in values.iter_mut().zip(fields) {
        *value = field
            .parse()
            .map_err(|_| IoError::Format(format!("Invalid number '{}' in '{}'", field, line)))?;
    }
    Ok(values)
}

/// Parses the text of a gen file.
///
/// # Errors
///
/// [`IoError::UnexpectedEof`] if the file ends before all atoms (and, for
/// periodic structures, the cell) have been read; [`IoError::Format`] for an
/// unknown geometry flag or malformed numbers.
pub fn parse_gen(text: &str) -> Result<GenStructure> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'));
    let mut next_line = || {
        lines
            .next()
            .ok_or_else(|| IoError::UnexpectedEof("The gen file ended prematurely.".to_string()))
    };

    let header = next_line()?;
    let fields: Vec<&str> = header.split_whitespace().collect();
    let [count, flag] = fields.as_slice() else {
        return Err(IoError::Format(format!("Invalid gen header '{}'", header)));
    };
    let n_atoms: usize = count
        .parse()
        .map_err(|_| IoError::Format(format!("Invalid atom count '{}'", count)))?;
    let (periodicity, coordinate_system) = match flag.to_ascii_uppercase().as_str() {
        "C" => (0, CoordinateSystem::Cartesian),
        "S" => (3, CoordinateSystem::Cartesian),
        "F" => (3, CoordinateSystem::Fractional),
        other => {
            return Err(IoError::Format(format!(
                "Don't recognize the type of geometry '{}'",
                other
            )))
        }
    };

    let type_names: Vec<String> = next_line()?.split_whitespace().map(str::to_string).collect();

    let mut elements = Vec::with_capacity(n_atoms);
    let mut coordinates = Vec::with_capacity(n_atoms);
    for _ in 0..n_atoms {
        let line = next_line()?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            return Err(IoError::Format(format!("Invalid atom line '{}'", line)));
        }
        let element = fields[1]
            .parse::<usize>()
            .ok()
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| type_names.get(i))
            .ok_or_else(|| IoError::Format(format!("Invalid type index in '{}'", line)))?;
        elements.push(element.clone());
        coordinates.push(parse_floats::<3>(&fields[2..], line)?);
    }

    let (origin, lattice) = if periodicity == 3 {
        let mut read_vector = || -> Result<[f64; 3]> {
            let line = next_line()?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            parse_floats::<3>(&fields, line)
        };
        let origin = read_vector()?;
        let lattice = [read_vector()?, read_vector()?, read_vector()?];
        (Some(origin), Some(lattice))
    } else {
        (None, None)
    };

    Ok(GenStructure {
        periodicity,
        coordinate_system,
        elements,
        coordinates,
        origin,
        lattice,
    })
}

/// Reads and parses a gen file.
pub fn read_gen(path: &Path) -> Result<GenStructure> {
    parse_gen(&fs::read_to_string(path)?)
}

/// A numeric table whose first column is the index (energy or k-point).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataTable {
    /// Rows of values, index column first
    pub rows: Vec<Vec<f64>>,
}

impl DataTable {
    /// Number of data columns, not counting the index column.
    pub fn n_columns(&self) -> usize {
        self.rows.first().map_or(0, |row| row.len().saturating_sub(1))
    }

    /// The index column.
    pub fn index(&self) -> Vec<f64> {
        self.rows.iter().map(|row| row[0]).collect()
    }

    /// Data column `i` (0 is the first column after the index).
    pub fn column(&self, i: usize) -> Vec<f64> {
        self.rows.iter().map(|row| row[i + 1]).collect()
    }
}

/// Parses a whitespace-separated numeric table. `!` starts a comment.
///
/// Every row must have the same number of columns.
pub fn parse_data_table(text: &str) -> Result<DataTable> {
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for line in text.lines() {
        let content = line.split('!').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let row = content
            .split_whitespace()
            .map(|field| {
                field
                    .parse::<f64>()
                    .map_err(|_| IoError::Format(format!("Invalid number '{}' in '{}'", field, line)))
            })
            .collect::<Result<Vec<f64>>>()?;
        if let Some(first) = rows.first() {
            if first.len() != row.len() {
                return Err(IoError::Format(format!(
                    "Expected {} columns but found {} in '{}'",
                    first.len(),
                    row.len(),
                    line
                )));
            }
        }
        rows.push(row);
    }
    Ok(DataTable { rows })
}

/// Reads and parses a data table file.
pub fn read_data_table(path: &Path) -> Result<DataTable> {
    parse_data_table(&fs::read_to_string(path)?)
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Renders rows as CSV text with a header line.
pub fn to_csv<H: AsRef<str>, F: Display>(header: &[H], rows: &[Vec<F>]) -> String {
    let mut text = header
        .iter()
        .map(|h| csv_field(h.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    text.push('\n');
    for row in rows {
        let line = row
            .iter()
            .map(|f| csv_field(&f.to_string()))
            .collect::<Vec<_>>()
            .join(",");
        text.push_str(&line);
        text.push('\n');
    }
    text
}

/// Writes rows as a CSV file with a header line.
pub fn write_csv<H: AsRef<str>, F: Display>(path: &Path, header: &[H], rows: &[Vec<F>]) -> Result<()> {
    fs::write(path, to_csv(header, rows))?;
    Ok(())
}

/// Writes a structure as an XYZ file. The comment line holds the name.
pub fn write_xyz(structure: &Structure, path: &Path) -> Result<()> {
    let mut content = format!(
        "{}\n{}\n",
        structure.n_atoms(),
        structure.name.as_deref().unwrap_or("")
    );
    for (element, [x, y, z]) in structure.elements.iter().zip(&structure.coordinates) {
        content.push_str(&format!("{}  {:.8}  {:.8}  {:.8}\n", element, x, y, z));
    }
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WATER_GEN: &str = "3  C\n O H\n 1 1  0.0 0.0 0.1\n 2 2  0.0 0.76 -0.5\n 3 2  0.0 -0.76 -0.5\n";

    #[test]
    fn test_parse_cluster_gen() {
        let parsed = parse_gen(WATER_GEN).unwrap();
        assert_eq!(parsed.periodicity, 0);
        assert_eq!(parsed.elements, vec!["O", "H", "H"]);
        assert_eq!(parsed.coordinates[1], [0.0, 0.76, -0.5]);
        assert!(parsed.lattice.is_none());
    }

    #[test]
    fn test_parse_fractional_gen() {
        let text = "2 F\nGa As\n1 1 0.0 0.0 0.0\n2 2 0.25 0.25 0.25\n0.0 0.0 0.0\n0.0 2.8 2.8\n2.8 0.0 2.8\n2.8 2.8 0.0\n";
        let parsed = parse_gen(text).unwrap();
        assert_eq!(parsed.periodicity, 3);
        assert_eq!(parsed.coordinate_system, CoordinateSystem::Fractional);
        assert_eq!(parsed.lattice.unwrap()[2], [2.8, 2.8, 0.0]);

        let structure = parsed.to_structure(&Structure::molecule(vec![], vec![]));
        assert_eq!(structure.periodicity(), 3);
        assert!((structure.coordinates[1][0] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_gen_errors() {
        assert!(matches!(
            parse_gen("3 C\nO H\n1 1 0 0 0\n"),
            Err(IoError::UnexpectedEof(_))
        ));
        assert!(matches!(parse_gen("1 X\nH\n1 1 0 0 0\n"), Err(IoError::Format(_))));
        assert!(matches!(
            parse_gen("1 S\nH\n1 1 0 0 0\n0 0 0\n1 0 0\n"),
            Err(IoError::UnexpectedEof(_))
        ));
    }

    #[test]
    fn test_data_table_with_comments() {
        let text = "! energy  total\n -1.0  0.5\n  0.0  1.5 ! centre\n\n  1.0  0.25\n";
        let table = parse_data_table(text).unwrap();
        assert_eq!(table.n_columns(), 1);
        assert_eq!(table.index(), vec![-1.0, 0.0, 1.0]);
        assert_eq!(table.column(0), vec![0.5, 1.5, 0.25]);
        assert!(matches!(
            parse_data_table("1.0 2.0\n3.0\n"),
            Err(IoError::Format(_))
        ));
    }

    #[test]
    fn test_csv_quoting_and_files() {
        let text = to_csv(&["E", "Total, up"], &[vec!["1".to_string(), "a\"b".to_string()]]);
        assert_eq!(text, "E,\"Total, up\"\n1,\"a\"\"b\"\n");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("table.csv");
        write_csv(&path, &["x", "y"], &[vec![1.5, 2.0]]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x,y\n1.5,2\n");

        let xyz = dir.path().join("water.xyz");
        let parsed = parse_gen(WATER_GEN).unwrap();
        write_xyz(&parsed.to_structure(&Structure::molecule(vec![], vec![])), &xyz).unwrap();
        let content = fs::read_to_string(&xyz).unwrap();
        assert!(content.starts_with("3\n\nO  0.00000000  0.00000000  0.10000000\n"));
    }
}
