//! Compatibility mapping - which disk types each machine family supports
//!
//! The document format is a nested JSON object:
//!
//! ```text
//! { "<machine-family>": { "<disk-type>": <bool>, ... }, ... }
//! ```
//!
//! `true` entries are compatible. `false` entries are explicit negative
//! assertions: they are parsed and then excluded from the resulting set.

use crate::error::{ParseError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Set of disk-type identifiers compatible with one machine family.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiskTypeSet {
    disk_types: BTreeSet<String>,
}

impl DiskTypeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, disk_type: impl Into<String>) -> bool {
        self.disk_types.insert(disk_type.into())
    }

    pub fn contains(&self, disk_type: &str) -> bool {
        self.disk_types.contains(disk_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.disk_types.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.disk_types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disk_types.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for DiskTypeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            disk_types: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Raw document shape: family -> disk type -> compatible.
type RawDocument = BTreeMap<String, BTreeMap<String, bool>>;

/// Mapping from machine family to its compatible disk types.
///
/// A family that is absent is distinct from a family that is present with an
/// empty set: [`CompatibilityMapping::get`] returns `None` for the former and
/// `Some(empty)` for the latter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompatibilityMapping {
    families: BTreeMap<String, DiskTypeSet>,
}

impl CompatibilityMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw compatibility document.
    ///
    /// Empty input (or only whitespace, or a JSON `null`) produces an empty
    /// mapping rather than an error.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::new());
        }

        let document: Option<RawDocument> = serde_json::from_slice(raw)?;
        let mut families = BTreeMap::new();

        for (family, entries) in document.unwrap_or_default() {
            if family.trim().is_empty() {
                return Err(ParseError::EmptyFamily);
            }

            let mut disk_types = DiskTypeSet::new();
            for (disk_type, compatible) in entries {
                if disk_type.trim().is_empty() {
                    return Err(ParseError::EmptyDiskType { family });
                }
                if compatible {
                    disk_types.insert(disk_type);
                }
            }
            families.insert(family, disk_types);
        }

        Ok(Self { families })
    }

    /// Insert or replace the disk types for a family.
    pub fn insert(&mut self, family: impl Into<String>, disk_types: DiskTypeSet) {
        self.families.insert(family.into(), disk_types);
    }

    pub fn get(&self, family: &str) -> Option<&DiskTypeSet> {
        self.families.get(family)
    }

    pub fn contains_family(&self, family: &str) -> bool {
        self.families.contains_key(family)
    }

    pub fn families(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DiskTypeSet)> {
        self.families.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}
