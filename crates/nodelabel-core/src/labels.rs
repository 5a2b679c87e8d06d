//! Node label model and the non-destructive label merge
//!
//! The merge is a union that only overwrites the keys this labeler owns:
//!  - every pre-existing key that is not required is kept verbatim
//!  - every required key is set to its freshly computed value
//!  - nothing is ever removed
//!
//! Applying the same [`RequiredLabels`] twice is a no-op the second time,
//! which is what makes reconciliation idempotent.

use crate::compat::DiskTypeSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known label carrying the node's instance type, e.g. `e2-medium`.
/// Read, never written.
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

/// Namespace prefix for every disk-type label this labeler owns.
pub const DISK_TYPE_KEY_PREFIX: &str = "disk-type.gke.io";

/// Value written for every compatible disk type.
pub const DISK_TYPE_LABEL_VALUE: &str = "true";

/// Full label set of a single node.
pub type NodeLabelSet = BTreeMap<String, String>;

/// Build the owned label key for a disk type: `disk-type.gke.io/<disk_type>`.
pub fn disk_type_label_key(disk_type: &str) -> String {
    format!("{}/{}", DISK_TYPE_KEY_PREFIX, disk_type)
}

/// Machine family of an instance type, e.g. `e2` for `e2-medium`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineFamily(String);

impl MachineFamily {
    /// Derive the family from an instance type string.
    ///
    /// The family is the segment before the first `-`. Returns `None` when
    /// there is no size suffix or the leading segment is not lowercase ASCII
    /// alphanumeric.
    pub fn from_instance_type(instance_type: &str) -> Option<Self> {
        let (family, size) = instance_type.split_once('-')?;
        if family.is_empty() || size.is_empty() {
            return None;
        }
        if !family
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return None;
        }
        Some(Self(family.to_string()))
    }

    /// Derive the family from a node's instance-type label, if present.
    pub fn of_node(labels: &NodeLabelSet) -> Option<Self> {
        labels
            .get(INSTANCE_TYPE_LABEL)
            .and_then(|instance_type| Self::from_instance_type(instance_type))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Labels a node must carry for its machine family.
///
/// Computed fresh on every reconcile and never stored on its own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequiredLabels {
    labels: BTreeMap<String, String>,
}

impl RequiredLabels {
    /// One `disk-type.gke.io/<type>: "true"` entry per compatible disk type.
    pub fn for_disk_types(disk_types: &DiskTypeSet) -> Self {
        Self {
            labels: disk_types
                .iter()
                .map(|disk_type| {
                    (
                        disk_type_label_key(disk_type),
                        DISK_TYPE_LABEL_VALUE.to_string(),
                    )
                })
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Merge into a node's current labels without removing anything.
    pub fn merge_into(&self, current: &NodeLabelSet) -> LabelMerge {
        let mut merged = current.clone();
        let mut updated_keys = Vec::new();

        for (key, value) in &self.labels {
            if merged.get(key) != Some(value) {
                merged.insert(key.clone(), value.clone());
                updated_keys.push(key.clone());
            }
        }

        LabelMerge {
            merged,
            updated_keys,
        }
    }
}

/// Result of merging [`RequiredLabels`] into a node's label set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelMerge {
    merged: NodeLabelSet,
    updated_keys: Vec<String>,
}

impl LabelMerge {
    /// Whether the merged set differs from the original.
    pub fn changed(&self) -> bool {
        !self.updated_keys.is_empty()
    }

    pub fn merged(&self) -> &NodeLabelSet {
        &self.merged
    }

    /// Owned keys that were added or overwritten, in key order.
    pub fn updated_keys(&self) -> &[String] {
        &self.updated_keys
    }

    pub fn into_merged(self) -> NodeLabelSet {
        self.merged
    }
}
