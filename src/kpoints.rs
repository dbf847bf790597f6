//! Brillouin-zone sampling for periodic systems.
//!
//! Two inputs are produced for the `KPointsAndWeights` entry of the
//! Hamiltonian:
//!
//! - a Monkhorst–Pack [`SupercellFolding`] mesh, sized either explicitly or
//!   from a target spacing in reciprocal space, for energies and DOS
//! - a [`Klines`] path through labelled high-symmetry points, for band
//!   structures
//!
//! Both render to the literal HSD text DFTB+ expects after
//! `KPointsAndWeights = `.

use crate::geometry::{GeometryError, Structure};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while building k-point input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KPointError {
    /// The structure cannot provide a reciprocal lattice
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// A path segment names a point that was not given
    #[error("Unknown high-symmetry point '{0}' in the band path")]
    UnknownLabel(String),
    /// The path has no segments
    #[error("The band path is empty")]
    EmptyPath,
    /// The spacing is not a positive number
    #[error("Invalid k-point spacing {0}")]
    InvalidSpacing(f64),
}

type Result<T> = std::result::Result<T, KPointError>;

/// How the integration mesh is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum KGrid {
    /// Enough points along each axis to reach the given spacing, in 1/Å
    GridSpacing {
        /// Target spacing in 1/Å
        spacing: f64,
    },
    /// An explicit number of points along each reciprocal axis
    SupercellFolding {
        /// Points along a*
        na: u32,
        /// Points along b*
        nb: u32,
        /// Points along c*
        nc: u32,
    },
}

/// A Monkhorst–Pack mesh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SupercellFolding {
    /// Points along each reciprocal axis
    pub counts: [u32; 3],
    /// Shift along each axis: 0.0 for odd counts, 0.5 for even ones
    pub offsets: [f64; 3],
}

impl SupercellFolding {
    /// A mesh with the given counts; zero counts are raised to 1.
    pub fn new(counts: [u32; 3]) -> Self {
        let counts = counts.map(|n| n.max(1));
        let offsets = counts.map(|n| if n % 2 == 1 { 0.0 } else { 0.5 });
        Self { counts, offsets }
    }

    /// Chooses the mesh for `structure` according to `grid`.
    ///
    /// With a spacing, each axis gets `round(|b_i| / spacing)` points, at
    /// least one, where `|b_i|` includes the 2π factor.
    pub fn for_structure(structure: &Structure, grid: &KGrid) -> Result<Self> {
        match *grid {
            KGrid::SupercellFolding { na, nb, nc } => Ok(Self::new([na, nb, nc])),
            KGrid::GridSpacing { spacing } => {
                if !(spacing > 0.0) {
                    return Err(KPointError::InvalidSpacing(spacing));
                }
                let lengths = structure.reciprocal_lengths()?;
                Ok(Self::new(lengths.map(|length| (length / spacing).round() as u32)))
            }
        }
    }

    /// The HSD value for `KPointsAndWeights`.
    pub fn to_hsd_value(&self) -> String {
        let [na, nb, nc] = self.counts;
        let [oa, ob, oc] = self.offsets;
        format!(
            "SupercellFolding {{\n            {} 0 0\n            0 {} 0\n            0 0 {}\n            {:?} {:?} {:?}\n        }}",
            na, nb, nc, oa, ob, oc
        )
    }

    /// A one-line description of the mesh.
    pub fn describe(&self) -> String {
        let [na, nb, nc] = self.counts;
        let [oa, ob, oc] = self.offsets;
        format!(
            "The mesh for the Brillouin zone integration is {} x {} x {} with offsets of {}, {}, and {}",
            na, nb, nc, oa, ob, oc
        )
    }
}

/// High-symmetry points and the segments connecting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandPath {
    /// Fractional reciprocal coordinates of each labelled point
    pub points: BTreeMap<String, [f64; 3]>,
    /// Segments as (start, end) labels, in path order
    pub segments: Vec<(String, String)>,
}

/// One entry of a `Klines` block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KLine {
    /// Points from the previous entry up to and including this one
    pub count: usize,
    /// Fractional reciprocal coordinates of the end point
    pub point: [f64; 3],
    /// Label of the end point
    pub label: String,
}

/// A band-structure path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Klines {
    /// The entries in order
    pub lines: Vec<KLine>,
    /// 1-based k-point index and label of every high-symmetry point
    pub labels: Vec<(usize, String)>,
    /// Cumulative path length in 1/Å at every k-point
    pub distances: Vec<f64>,
}

impl Klines {
    /// Distributes roughly `n_points` k-points over `path`.
    ///
    /// Each segment gets `max(2, round(n * length / total))` points, where
    /// `n` is `n_points` less one point for the start of the path and one for
    /// every break. Segment lengths are measured with `reciprocal` (rows are
    /// the reciprocal lattice vectors).
    pub fn generate(path: &BandPath, reciprocal: &Matrix3<f64>, n_points: usize) -> Result<Self> {
        if path.segments.is_empty() {
            return Err(KPointError::EmptyPath);
        }
        let lookup = |label: &str| -> Result<Vector3<f64>> {
            path.points
                .get(label)
                .map(|p| Vector3::from(*p))
                .ok_or_else(|| KPointError::UnknownLabel(label.to_string()))
        };
        let cartesian = |fractional: &Vector3<f64>| reciprocal.transpose() * fractional;

        let mut total_length = 0.0;
        let mut extra_points = 0usize;
        let mut last_label = "";
        for (start, stop) in &path.segments {
            let a = lookup(start)?;
            let b = lookup(stop)?;
            total_length += (cartesian(&b) - cartesian(&a)).norm();
            if start != last_label {
                extra_points += 1;
            }
            last_label = stop;
        }
        let n = n_points.saturating_sub(extra_points) as f64;

        let mut lines = Vec::new();
        let mut labels = Vec::new();
        let mut distances = Vec::new();
        let mut total = 0usize;
        let mut distance = 0.0;
        let mut last_label = "";
        for (start, stop) in &path.segments {
            let a = lookup(start)?;
            let b = lookup(stop)?;
            let length = (cartesian(&b) - cartesian(&a)).norm();

            if start != last_label {
                lines.push(KLine {
                    count: 1,
                    point: [a.x, a.y, a.z],
                    label: start.clone(),
                });
                total += 1;
                labels.push((total, start.clone()));
                distances.push(distance);
            }
            last_label = stop;

            let share = if total_length > 0.0 {
                (n * length / total_length).round() as usize
            } else {
                0
            };
            let count = share.max(2);
            for _ in 0..count {
                distance += length / count as f64;
                distances.push(distance);
            }
            lines.push(KLine {
                count,
                point: [b.x, b.y, b.z],
                label: stop.clone(),
            });
            total += count;
            labels.push((total, stop.clone()));
        }

        Ok(Self {
            lines,
            labels,
            distances,
        })
    }

    /// Total number of k-points on the path.
    pub fn n_points(&self) -> usize {
        self.lines.iter().map(|line| line.count).sum()
    }

    /// The HSD value for `KPointsAndWeights`.
    pub fn to_hsd_value(&self) -> String {
        let mut text = String::from("Klines {\n");
        for line in &self.lines {
            let [x, y, z] = line.point;
            text.push_str(&format!(
                "        {:4} {:.4} {:.4} {:.4}   # {}\n",
                line.count, x, y, z, line.label
            ));
        }
        text.push_str("        }");
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cubic(a: f64) -> Structure {
        Structure::periodic(
            vec!["Po".into()],
            vec![[0.0; 3]],
            [[a, 0.0, 0.0], [0.0, a, 0.0], [0.0, 0.0, a]],
        )
    }

    fn path(segments: &[(&str, &str)]) -> BandPath {
        let mut points = BTreeMap::new();
        points.insert("G".to_string(), [0.0, 0.0, 0.0]);
        points.insert("X".to_string(), [0.0, 0.5, 0.0]);
        points.insert("M".to_string(), [0.5, 0.5, 0.0]);
        points.insert("R".to_string(), [0.5, 0.5, 0.5]);
        BandPath {
            points,
            segments: segments
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_folding_offsets() {
        let mesh = SupercellFolding::new([4, 3, 0]);
        assert_eq!(mesh.counts, [4, 3, 1]);
        assert_eq!(mesh.offsets, [0.5, 0.0, 0.0]);
        assert_eq!(
            mesh.to_hsd_value(),
            "SupercellFolding {\n            4 0 0\n            0 3 0\n            0 0 1\n            0.5 0.0 0.0\n        }"
        );
    }

    #[test]
    fn test_mesh_from_spacing_uses_each_axis() {
        let structure = Structure::periodic(
            vec!["Si".into()],
            vec![[0.0; 3]],
            [[3.0, 0.0, 0.0], [0.0, 6.0, 0.0], [0.0, 0.0, 12.0]],
        );
        let mesh =
            SupercellFolding::for_structure(&structure, &KGrid::GridSpacing { spacing: 0.2 })
                .unwrap();
        // 2π/3 / 0.2 = 10.47, 2π/6 / 0.2 = 5.24, 2π/12 / 0.2 = 2.62
        assert_eq!(mesh.counts, [10, 5, 3]);
    }

    #[test]
    fn test_mesh_needs_a_cell() {
        let molecule = Structure::molecule(vec!["H".into()], vec![[0.0; 3]]);
        assert_eq!(
            SupercellFolding::for_structure(&molecule, &KGrid::GridSpacing { spacing: 0.2 }),
            Err(KPointError::Geometry(GeometryError::NotPeriodic))
        );
        assert!(matches!(
            SupercellFolding::for_structure(&cubic(4.0), &KGrid::GridSpacing { spacing: 0.0 }),
            Err(KPointError::InvalidSpacing(_))
        ));
    }

    #[test]
    fn test_klines_continuous_path() {
        let reciprocal = cubic(2.0 * std::f64::consts::PI).reciprocal_lattice().unwrap();
        // |G-X| = 0.5, |X-M| = 0.5 in these units
        let klines = Klines::generate(&path(&[("G", "X"), ("X", "M")]), &reciprocal, 21).unwrap();
        let counts: Vec<usize> = klines.lines.iter().map(|l| l.count).collect();
        assert_eq!(counts, vec![1, 10, 10]);
        assert_eq!(klines.n_points(), 21);
        assert_eq!(
            klines.labels,
            vec![(1, "G".to_string()), (11, "X".to_string()), (21, "M".to_string())]
        );
        assert_eq!(klines.distances.len(), 21);
        assert_relative_eq!(klines.distances[20], 1.0, epsilon = 1e-12);
        assert!(klines
            .to_hsd_value()
            .starts_with("Klines {\n           1 0.0000 0.0000 0.0000   # G\n          10 0.0000 0.5000 0.0000   # X\n"));
    }

    #[test]
    fn test_klines_break_adds_a_point() {
        let reciprocal = cubic(2.0 * std::f64::consts::PI).reciprocal_lattice().unwrap();
        let klines =
            Klines::generate(&path(&[("G", "X"), ("M", "R")]), &reciprocal, 12).unwrap();
        let counts: Vec<usize> = klines.lines.iter().map(|l| l.count).collect();
        assert_eq!(counts, vec![1, 5, 1, 5]);
        assert_eq!(klines.labels[2], (7, "M".to_string()));
        // The jump from X to M does not add path length.
        assert_relative_eq!(klines.distances[6], klines.distances[5], epsilon = 1e-12);
    }

    #[test]
    fn test_klines_short_segments_get_two_points() {
        let reciprocal = cubic(2.0 * std::f64::consts::PI).reciprocal_lattice().unwrap();
        let klines = Klines::generate(&path(&[("G", "X")]), &reciprocal, 2).unwrap();
        assert_eq!(klines.lines[1].count, 2);
        assert!(matches!(
            Klines::generate(&path(&[("G", "Q")]), &reciprocal, 10),
            Err(KPointError::UnknownLabel(label)) if label == "Q"
        ));
    }
}
