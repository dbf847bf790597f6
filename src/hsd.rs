//! Nested configuration trees and their HSD rendering.
//!
//! DFTB+ reads its input from `dftb_in.hsd`, a block-structured text format:
//!
//! ```text
//! Hamiltonian {
//!     DFTB {
//!         SCC = Yes
//!         MaxSCCIterations = 100
//!     }
//! }
//! ```
//!
//! Every calculation step builds a [`ConfigTree`] describing its part of the
//! input, layers it over the input accumulated so far with [`deep_merge`], and
//! the final tree is rendered with [`to_hsd`].
//!
//! # Keys
//!
//! Keys are used verbatim, so HSD modifiers and method selections are simply
//! part of the key (`"Filling = Fermi"`, `"Temperature [K]"`). A nested-block
//! key may carry a `<...>` suffix so that repeated blocks with the same HSD
//! name can live side by side in one tree; the suffix is dropped on output:
//!
//! ```
//! use dftbstep::hsd::{to_hsd, ConfigTree};
//!
//! let mut tree = ConfigTree::new();
//! tree.tree_mut("ProjectStates").tree_mut("Region<1>").insert("Atoms", "C");
//! tree.tree_mut("ProjectStates").tree_mut("Region<2>").insert("Atoms", "H");
//! let text = to_hsd(&tree, 4);
//! assert_eq!(text.matches("Region {").count(), 2);
//! ```

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Default indentation used by DFTB+ input files.
pub const DEFAULT_INDENT: usize = 4;

/// A leaf value in a configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// HSD logical, rendered as `Yes` / `No`
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Real value, rendered in shortest round-trip form
    Real(f64),
    /// Text inserted verbatim; the caller supplies any quotes or braces
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(true) => write!(f, "Yes"),
            Scalar::Bool(false) => write!(f, "No"),
            Scalar::Int(value) => write!(f, "{}", value),
            // Debug keeps a decimal point on integral reals (300.0) and uses
            // exponents for very small or large magnitudes (1e-5).
            Scalar::Real(value) => write!(f, "{:?}", value),
            Scalar::Text(value) => write!(f, "{}", value),
        }
    }
}

/// A value in a configuration tree: either a scalar or a nested mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A leaf value, emitted as `key = value`
    Scalar(Scalar),
    /// A nested block, emitted as `key { ... }`
    Nested(ConfigTree),
}

impl ConfigValue {
    /// Returns the nested tree, if this value is one.
    pub fn as_tree(&self) -> Option<&ConfigTree> {
        match self {
            ConfigValue::Nested(tree) => Some(tree),
            ConfigValue::Scalar(_) => None,
        }
    }

    /// Returns the scalar, if this value is one.
    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            ConfigValue::Scalar(scalar) => Some(scalar),
            ConfigValue::Nested(_) => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Scalar(Scalar::Bool(value))
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Scalar(Scalar::Int(value))
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        ConfigValue::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        ConfigValue::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<usize> for ConfigValue {
    fn from(value: usize) -> Self {
        ConfigValue::Scalar(Scalar::Int(value as i64))
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Scalar(Scalar::Real(value))
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Scalar(Scalar::Text(value.to_string()))
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Scalar(Scalar::Text(value))
    }
}

impl From<ConfigTree> for ConfigValue {
    fn from(value: ConfigTree) -> Self {
        ConfigValue::Nested(value)
    }
}

/// An insertion-ordered mapping from keys to [`ConfigValue`]s.
///
/// Order only matters for the emitted text. Re-inserting an existing key
/// replaces the value in place and keeps its position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConfigTree {
    entries: Vec<(String, ConfigValue)>,
}

impl ConfigTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys at this level.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no keys at this level.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a key at this level.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Mutable lookup of a key at this level.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut ConfigValue> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Looks up a nested tree at this level.
    pub fn get_tree(&self, key: &str) -> Option<&ConfigTree> {
        self.get(key).and_then(ConfigValue::as_tree)
    }

    /// Mutable lookup of a nested tree at this level.
    pub fn get_tree_mut(&mut self, key: &str) -> Option<&mut ConfigTree> {
        match self.get_mut(key) {
            Some(ConfigValue::Nested(tree)) => Some(tree),
            _ => None,
        }
    }

    /// Follows a path of nested keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&ConfigValue> {
        let (last, parents) = path.split_last()?;
        let mut tree = self;
        for key in parents {
            tree = tree.get_tree(key)?;
        }
        tree.get(last)
    }

    /// True if the key exists at this level.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn insert(&mut self, key: &str, value: impl Into<ConfigValue>) -> Option<ConfigValue> {
        let value = value.into();
        match self.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key.to_string(), value));
                None
            }
        }
    }

    /// Removes a key at this level.
    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Returns the nested tree at `key`, creating it (and replacing any
    /// scalar stored there) if necessary.
    pub fn tree_mut(&mut self, key: &str) -> &mut ConfigTree {
        let index = match self.entries.iter().position(|(k, _)| k == key) {
            Some(index) => index,
            None => {
                self.entries.push((key.to_string(), ConfigTree::new().into()));
                self.entries.len() - 1
            }
        };
        let slot = &mut self.entries[index].1;
        if let ConfigValue::Scalar(_) = slot {
            *slot = ConfigTree::new().into();
        }
        match slot {
            ConfigValue::Nested(tree) => tree,
            ConfigValue::Scalar(_) => unreachable!("entry was just made a nested tree"),
        }
    }

    /// Iterates over the entries at this level in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys at this level in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>, V: Into<ConfigValue>> FromIterator<(K, V)> for ConfigTree {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tree = ConfigTree::new();
        for (key, value) in iter {
            let key: String = key.into();
            tree.insert(&key, value);
        }
        tree
    }
}

/// Deep-merges `source` into `destination`.
///
/// - A nested value in `source` is merged into the nested value of the same
///   key in `destination`, which is created (or replaces a scalar) if needed.
/// - A scalar value in `source` overwrites whatever `destination` holds at
///   that key, including a nested tree.
/// - Keys present only in `destination` are never removed.
///
/// The walk uses an explicit work list, so depth is bounded only by memory.
/// `source` is left untouched.
pub fn deep_merge(destination: &mut ConfigTree, source: &ConfigTree) {
    let mut work: VecDeque<(&mut ConfigTree, &ConfigTree)> = VecDeque::new();
    work.push_back((destination, source));

    while let Some((dest, src)) = work.pop_front() {
        for (key, value) in src.iter() {
            match value {
                ConfigValue::Scalar(_) => {
                    dest.insert(key, value.clone());
                }
                ConfigValue::Nested(_) => {
                    if !matches!(dest.get(key), Some(ConfigValue::Nested(_))) {
                        dest.insert(key, ConfigTree::new());
                    }
                }
            }
        }

        for (key, value) in dest.entries.iter_mut() {
            if let ConfigValue::Nested(child) = value {
                if let Some(ConfigValue::Nested(sub)) = src.get(key) {
                    work.push_back((child, sub));
                }
            }
        }
    }
}

/// Renders a tree as HSD text with `indent_width` spaces per level.
///
/// Scalars become `key = value` lines; nested trees become `key {`, the
/// indented body and a closing `}`. No escaping is done.
pub fn to_hsd(tree: &ConfigTree, indent_width: usize) -> String {
    let mut out = String::new();
    write_block(&mut out, tree, 0, indent_width);
    out
}

/// Renders a tree as HSD text with the default four-space indentation.
pub fn emit(tree: &ConfigTree) -> String {
    to_hsd(tree, DEFAULT_INDENT)
}

fn write_block(out: &mut String, tree: &ConfigTree, indent: usize, width: usize) {
    let pad = " ".repeat(indent);
    for (key, value) in tree.iter() {
        match value {
            ConfigValue::Nested(child) => {
                let name = key.split('<').next().unwrap_or(key);
                out.push_str(&format!("{}{} {{\n", pad, name));
                write_block(out, child, indent + width, width);
                out.push_str(&format!("{}}}\n", pad));
            }
            ConfigValue::Scalar(scalar) => {
                out.push_str(&format!("{}{} = {}\n", pad, key, scalar));
            }
        }
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigValue::Scalar(Scalar::Bool(v)) => serializer.serialize_bool(*v),
            ConfigValue::Scalar(Scalar::Int(v)) => serializer.serialize_i64(*v),
            ConfigValue::Scalar(Scalar::Real(v)) => serializer.serialize_f64(*v),
            ConfigValue::Scalar(Scalar::Text(v)) => serializer.serialize_str(v),
            ConfigValue::Nested(tree) => tree.serialize(serializer),
        }
    }
}

impl Serialize for ConfigTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct ConfigValueVisitor;

impl<'de> Visitor<'de> for ConfigValueVisitor {
    type Value = ConfigValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a boolean, number, string or mapping")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ConfigValue, E> {
        Ok(v.into())
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ConfigValue, E> {
        Ok(v.into())
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ConfigValue, E> {
        i64::try_from(v)
            .map(ConfigValue::from)
            .map_err(|_| E::custom(format!("integer {} is too large", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ConfigValue, E> {
        Ok(v.into())
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ConfigValue, E> {
        Ok(v.into())
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ConfigValue, E> {
        Ok(v.into())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ConfigValue, A::Error> {
        let mut tree = ConfigTree::new();
        while let Some((key, value)) = access.next_entry::<String, ConfigValue>()? {
            tree.insert(&key, value);
        }
        Ok(ConfigValue::Nested(tree))
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ConfigValueVisitor)
    }
}

impl<'de> Deserialize<'de> for ConfigTree {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ConfigValue::deserialize(deserializer)? {
            ConfigValue::Nested(tree) => Ok(tree),
            ConfigValue::Scalar(_) => Err(de::Error::custom("expected a mapping at the top level")),
        }
    }
}
