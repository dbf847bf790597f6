//! Parser for the tagged results stream (`results.tag`) written by DFTB+.
//!
//! The stream is a sequence of records. Each record starts with a header
//!
//! ```text
//! name:type:ndims:dim1,dim2,...
//! ```
//!
//! followed by one value line for scalars (`ndims == 0`), or by enough
//! whitespace-separated tokens, spread over any number of lines, to fill
//! `product(dims)` elements. Lines starting with `#` are comments.
//!
//! Only `real` values are converted to numbers; every other type is kept as
//! text. Arrays are rebuilt with [`crate::reshape::reshape`], last dimension
//! fastest.
//!
//! After the records are read, a few entries are derived:
//!
//! - `energy` from `total_energy`, in `E_h`
//! - `gradients` as the negation of `forces`, in the units of `forces`:
//!   the gradient is the negated force, so the units stay the same
//! - a collapsed `fermi_level` plus a `spin polarized` flag
//!
//! Every key whose metadata declares units gets a `key,units` companion.
//!
//! # Examples
//!
//! ```
//! use dftbstep::metadata::PropertyTable;
//! use dftbstep::results::{parse, ResultValue};
//!
//! let text = "total_energy:real:0:\n-8.25\n";
//! let results = parse(text, PropertyTable::standard()).unwrap();
//! assert_eq!(results.get_real("energy"), Some(-8.25));
//! assert_eq!(results.get("energy,units"), Some(&ResultValue::Text("E_h".into())));
//! ```

use crate::metadata::PropertyTable;
use crate::reshape::{element_count, reshape, NdArray, ShapeError};
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while parsing a results stream.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResultsError {
    /// A header line could not be understood
    #[error("Problem parsing the results.tag file: {line}: {text}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// The offending line
        text: String,
    },
    /// The payload does not fit the declared dimensions
    #[error(transparent)]
    Shape(#[from] ShapeError),
    /// The results describe a case that is deliberately not handled
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

type Result<T> = std::result::Result<T, ResultsError>;

/// Element type declared in a record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// `real`, converted to `f64`
    Real,
    /// `integer`, kept as text
    Integer,
    /// `logical`, `string` or anything else, kept as text
    Text,
}

impl ValueType {
    fn from_tag(tag: &str) -> Self {
        match tag.trim() {
            "real" => ValueType::Real,
            "integer" => ValueType::Integer,
            _ => ValueType::Text,
        }
    }
}

/// A value stored in a [`ResultMap`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    /// A real number
    Real(f64),
    /// Text, including integers from the results stream and unit strings
    Text(String),
    /// A flag
    Flag(bool),
    /// A nested array of reals
    RealArray(NdArray<f64>),
    /// A nested array of text values
    TextArray(NdArray<String>),
}

impl ResultValue {
    /// The value as a real number, if it is one.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            ResultValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResultValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a real array, if it is one.
    pub fn as_real_array(&self) -> Option<&NdArray<f64>> {
        match self {
            ResultValue::RealArray(v) => Some(v),
            _ => None,
        }
    }
}

/// One record of the results stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedRecord {
    /// Record name
    pub key: String,
    /// Declared element type
    pub value_type: ValueType,
    /// Declared dimensions; empty for a scalar
    pub dimensions: Vec<usize>,
    /// The value, shaped according to `dimensions`
    pub payload: ResultValue,
}

/// Parsed results keyed by name. Later records overwrite earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ResultMap {
    values: BTreeMap<String, ResultValue>,
}

impl ResultMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a value.
    pub fn get(&self, key: &str) -> Option<&ResultValue> {
        self.values.get(key)
    }

    /// Looks up a real value.
    pub fn get_real(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ResultValue::as_real)
    }

    /// Looks up a text value.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ResultValue::as_text)
    }

    /// Looks up a real array.
    pub fn get_real_array(&self, key: &str) -> Option<&NdArray<f64>> {
        self.get(key).and_then(ResultValue::as_real_array)
    }

    /// Units recorded for a key.
    pub fn units(&self, key: &str) -> Option<&str> {
        self.get_text(&units_key(key))
    }

    /// True if the key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Inserts or replaces a value.
    pub fn insert(&mut self, key: impl Into<String>, value: ResultValue) -> Option<ResultValue> {
        self.values.insert(key.into(), value)
    }

    /// Inserts a value together with its `key,units` companion.
    pub fn insert_with_units(&mut self, key: &str, value: ResultValue, units: &str) {
        self.values.insert(key.to_string(), value);
        self.values
            .insert(units_key(key), ResultValue::Text(units.to_string()));
    }

    /// Iterates over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResultValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copies every entry of `other` into this map.
    pub fn extend(&mut self, other: ResultMap) {
        self.values.extend(other.values);
    }
}

/// Name of the units companion for `key`.
pub fn units_key(key: &str) -> String {
    format!("{},units", key)
}

/// A cursor over the lines of the stream.
struct LineCursor<'a> {
    lines: Vec<&'a str>,
    position: usize,
}

impl<'a> LineCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            position: 0,
        }
    }

    fn has_next(&self) -> bool {
        self.position < self.lines.len()
    }

    /// Returns the next line and its 1-based number.
    fn next_line(&mut self) -> Option<(usize, &'a str)> {
        let line = *self.lines.get(self.position)?;
        self.position += 1;
        Some((self.position, line))
    }
}

struct Header<'a> {
    key: &'a str,
    value_type: ValueType,
    dimensions: Vec<usize>,
    count: usize,
}

fn parse_header(line_number: usize, line: &str) -> Result<Header<'_>> {
    let malformed = || ResultsError::Parse {
        line: line_number,
        text: line.to_string(),
    };

    if !line.contains(':') {
        return Err(malformed());
    }
    let parts: Vec<&str> = line.splitn(4, ':').collect();
    let parse_dims = |text: &str| -> Result<Vec<usize>> {
        text.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| t.parse::<usize>().map_err(|_| malformed()))
            .collect()
    };

    let (key, tag, ndims, dims) = match parts.as_slice() {
        [key, tag, ndims, rest] => {
            let ndims: usize = ndims.trim().parse().map_err(|_| malformed())?;
            let dims = if ndims == 0 { Vec::new() } else { parse_dims(*rest)? };
            (*key, *tag, ndims, dims)
        }
        [key, tag, ndims] if ndims.trim() == "0" => (*key, *tag, 0, Vec::new()),
        // `name:type:d1,d2` without the ndims field
        [key, tag, dims] if dims.contains(',') => {
            let dims = parse_dims(*dims)?;
            (*key, *tag, dims.len(), dims)
        }
        _ => return Err(malformed()),
    };

    if dims.len() != ndims {
        return Err(malformed());
    }
    let count = element_count(&dims).ok_or_else(malformed)?;

    Ok(Header {
        key: key.trim(),
        value_type: ValueType::from_tag(tag),
        dimensions: dims,
        count,
    })
}

fn coerce_real(line_number: usize, token: &str) -> Result<f64> {
    token.trim().parse().map_err(|_| ResultsError::Parse {
        line: line_number,
        text: token.to_string(),
    })
}

/// Reads the raw records of a results stream, in order.
///
/// Reaching the end of the stream in the middle of a record ends the stream;
/// the incomplete record is dropped.
pub fn parse_records(text: &str) -> Result<Vec<TaggedRecord>> {
    let mut cursor = LineCursor::new(text);
    let mut records = Vec::new();

    while let Some((line_number, line)) = cursor.next_line() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let header = parse_header(line_number, line)?;

        let payload = if header.dimensions.is_empty() {
            if !cursor.has_next() {
                debug!("Results stream ended before the value of '{}'", header.key);
                break;
            }
            let Some((value_line, value)) = cursor.next_line() else {
                break;
            };
            match header.value_type {
                ValueType::Real => ResultValue::Real(coerce_real(value_line, value)?),
                _ => ResultValue::Text(value.trim().to_string()),
            }
        } else {
            let expected = header.count;
            let mut tokens: Vec<(usize, &str)> = Vec::new();
            while tokens.len() < expected && cursor.has_next() {
                if let Some((n, payload_line)) = cursor.next_line() {
                    tokens.extend(payload_line.split_whitespace().map(|t| (n, t)));
                }
            }
            if tokens.len() < expected {
                debug!(
                    "Results stream ended after {} of {} values of '{}'",
                    tokens.len(),
                    expected,
                    header.key
                );
                break;
            }
            match header.value_type {
                ValueType::Real => {
                    let values = tokens
                        .iter()
                        .map(|(n, t)| coerce_real(*n, t))
                        .collect::<Result<Vec<f64>>>()?;
                    ResultValue::RealArray(reshape(values, &header.dimensions)?)
                }
                _ => {
                    let values = tokens.iter().map(|(_, t)| t.to_string()).collect();
                    ResultValue::TextArray(reshape(values, &header.dimensions)?)
                }
            }
        };

        records.push(TaggedRecord {
            key: header.key.to_string(),
            value_type: header.value_type,
            dimensions: header.dimensions,
            payload,
        });
    }

    Ok(records)
}

/// Collapses a Fermi level array to its first value.
///
/// Returns the value and whether two values were present.
fn collapse_fermi_level(payload: &ResultValue) -> Result<Option<(ResultValue, bool)>> {
    let ResultValue::RealArray(array) = payload else {
        return Ok(None);
    };
    let values: Vec<f64> = array.flatten().into_iter().copied().collect();
    match values.as_slice() {
        [single] => Ok(Some((ResultValue::Real(*single), false))),
        [first, second] if first == second => Ok(Some((ResultValue::Real(*first), true))),
        [first, second] => Err(ResultsError::NotImplemented(format!(
            "Cannot handle different Fermi energies yet: [{}, {}]",
            first, second
        ))),
        _ => Ok(None),
    }
}

/// Parses a results stream into a [`ResultMap`].
///
/// `properties` supplies units and the list of known keys; an unknown key is
/// kept and logged as a warning.
pub fn parse(text: &str, properties: &PropertyTable) -> Result<ResultMap> {
    let mut results = ResultMap::new();

    for record in parse_records(text)? {
        let key = record.key;
        if key == "fermi_level" {
            if let Some((value, two_valued)) = collapse_fermi_level(&record.payload)? {
                results.insert(key.clone(), value);
                results.insert("spin polarized", ResultValue::Flag(two_valued));
            } else {
                results.insert(key.clone(), record.payload);
            }
        } else {
            results.insert(key.clone(), record.payload);
        }

        match properties.get(&key) {
            None => warn!("Property '{}' not recognized.", key),
            Some(metadata) => {
                if let Some(units) = &metadata.units {
                    results.insert(units_key(&key), ResultValue::Text(units.clone()));
                }
            }
        }
    }

    add_derived(&mut results, properties);
    Ok(results)
}

fn add_derived(results: &mut ResultMap, properties: &PropertyTable) {
    if let Some(total) = results.get("total_energy").cloned() {
        results.insert_with_units("energy", total, "E_h");
    }

    if let Some(forces) = results.get_real_array("forces") {
        let gradients = ResultValue::RealArray(forces.map(|v| -v));
        let units = results
            .units("forces")
            .or_else(|| properties.units("forces"))
            .unwrap_or("E_h/bohr")
            .to_string();
        results.insert_with_units("gradients", gradients, &units);
    }
}
