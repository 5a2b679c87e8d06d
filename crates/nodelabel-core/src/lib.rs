//! # nodelabel-core
//!
//! Data model and pure logic for the disk-type node labeler.
//!
//! This crate provides:
//! - The machine-family → disk-type compatibility mapping and its parser
//! - A [`CompatibilityStore`] that swaps whole snapshots atomically
//! - Machine family extraction from the instance-type label
//! - The non-destructive label merge used by the reconciler
//!
//! ## Example
//!
//! ```rust
//! use nodelabel_core::{CompatibilityStore, MachineFamily, NodeLabelSet, RequiredLabels};
//! use nodelabel_core::labels::INSTANCE_TYPE_LABEL;
//!
//! let store = CompatibilityStore::new();
//! store
//!     .refresh(br#"{ "e2": { "pd-standard": true, "pd-ssd": true } }"#)
//!     .unwrap();
//!
//! let mut labels = NodeLabelSet::new();
//! labels.insert(INSTANCE_TYPE_LABEL.to_string(), "e2-medium".to_string());
//!
//! let family = MachineFamily::of_node(&labels).unwrap();
//! let disks = store.lookup(family.as_str()).unwrap();
//! let merge = RequiredLabels::for_disk_types(&disks).merge_into(&labels);
//! assert!(merge.changed());
//! assert_eq!(merge.merged().len(), 3);
//! ```

pub mod compat;
pub mod error;
pub mod labels;
pub mod store;

pub use compat::{CompatibilityMapping, DiskTypeSet};
pub use error::{ParseError, Result};
pub use labels::{LabelMerge, MachineFamily, NodeLabelSet, RequiredLabels};
pub use store::{CompatibilityStore, RefreshSummary};
