//! Shared, swappable compatibility snapshot.
//!
//! Refreshes build a complete [`CompatibilityMapping`] off to the side and
//! then swap a single `Arc` under a short write lock. Readers either see the
//! previous snapshot or the new one, never a partial mapping. A rejected
//! document leaves the current snapshot untouched.

use crate::compat::{CompatibilityMapping, DiskTypeSet};
use crate::error::Result;
use parking_lot::RwLock;
use std::sync::Arc;

/// Summary of a successful refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Number of machine families in the new mapping.
    pub families: usize,
    /// Generation of the new snapshot.
    pub generation: u64,
}

#[derive(Debug)]
struct Snapshot {
    mapping: Arc<CompatibilityMapping>,
    generation: u64,
}

/// Holds the current compatibility mapping and serves lookups.
#[derive(Debug)]
pub struct CompatibilityStore {
    current: RwLock<Snapshot>,
}

impl CompatibilityStore {
    /// Create a store with an empty mapping at generation 0.
    pub fn new() -> Self {
        Self::with_mapping(CompatibilityMapping::new())
    }

    pub fn with_mapping(mapping: CompatibilityMapping) -> Self {
        Self {
            current: RwLock::new(Snapshot {
                mapping: Arc::new(mapping),
                generation: 0,
            }),
        }
    }

    /// Parse `raw` and atomically replace the current mapping.
    ///
    /// On a parse error the previous mapping stays in place.
    pub fn refresh(&self, raw: &[u8]) -> Result<RefreshSummary> {
        let mapping = match CompatibilityMapping::parse(raw) {
            Ok(mapping) => mapping,
            Err(err) => {
                tracing::warn!(error = %err, "rejected compatibility document, keeping previous mapping");
                return Err(err);
            }
        };
        Ok(self.replace(mapping))
    }

    /// Atomically replace the current mapping with an already built one.
    pub fn replace(&self, mapping: CompatibilityMapping) -> RefreshSummary {
        let families = mapping.len();
        let mapping = Arc::new(mapping);

        let mut current = self.current.write();
        current.mapping = mapping;
        current.generation += 1;
        let generation = current.generation;
        drop(current);

        tracing::debug!(families, generation, "compatibility mapping replaced");
        RefreshSummary {
            families,
            generation,
        }
    }

    /// Disk types for a family; `None` when the family is unknown.
    pub fn lookup(&self, family: &str) -> Option<DiskTypeSet> {
        self.current.read().mapping.get(family).cloned()
    }

    /// The current mapping as an immutable shared snapshot.
    pub fn snapshot(&self) -> Arc<CompatibilityMapping> {
        Arc::clone(&self.current.read().mapping)
    }

    /// Number of successful replacements since creation.
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }
}

impl Default for CompatibilityStore {
    fn default() -> Self {
        Self::new()
    }
}
