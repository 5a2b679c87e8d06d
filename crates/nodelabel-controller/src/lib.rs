//! Node label controller for the disk-type node labeler.
//!
//! Keeps the disk-type labels of every node in step with the machine family
//! compatibility mapping, without ever removing a label it did not set.
//!
//! # Quick Start
//!
//! ```rust
//! use nodelabel_controller::prelude::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut labels = NodeLabelSet::new();
//! labels.insert(INSTANCE_TYPE_LABEL.to_string(), "n2-standard-4".to_string());
//! let nodes = Arc::new(MemoryNodeStore::with_nodes([(NodeId::new("node-a"), labels)]));
//!
//! let compatibility = Arc::new(CompatibilityStore::new());
//! compatibility
//!     .refresh(br#"{ "n2": { "pd-balanced": true } }"#)
//!     .unwrap();
//!
//! let reconciler = LabelReconciler::new(Arc::clone(&nodes), compatibility);
//! let outcome = reconciler.reconcile(&NodeId::new("node-a")).await.unwrap();
//! assert!(outcome.changed());
//!
//! let labels = nodes.labels(&NodeId::new("node-a")).unwrap();
//! assert_eq!(labels.get("disk-type.gke.io/pd-balanced").map(String::as_str), Some("true"));
//! # });
//! ```
//!
//! # Architecture
//!
//! - [`node_store`] - Node store abstraction and in-memory implementation
//! - [`file_store`] - Node store backed by a JSON inventory file
//! - [`source`] - Where the compatibility document comes from
//! - [`refresher`] - Applies changed documents to the compatibility store
//! - [`reconciler`] - Single-node label reconciliation
//! - [`queue`] - De-duplicating work queue
//! - [`controller`] - Workers, retries, polling and resync
//! - [`config`] - Controller configuration
//! - [`cancel`] - Cooperative cancellation
//! - [`error`] - Error types

pub mod cancel;
pub mod config;
pub mod controller;
pub mod error;
pub mod file_store;
pub mod node_store;
pub mod queue;
pub mod reconciler;
pub mod refresher;
pub mod source;

// Re-exports for convenience
pub use cancel::{cancellation, CancelHandle, Cancellation};
pub use config::{ControllerConfig, ControllerConfigBuilder, RetryPolicy};
pub use controller::{Controller, ControllerEvent, ReconcileReport};
pub use error::{ControllerError, NodeStoreError, ReconcileError, RefreshError, Result, SourceError};
pub use file_store::FileNodeStore;
pub use node_store::{
    MemoryNodeStore, NodeId, NodeSnapshot, NodeStore, ReadFault, ResourceVersion, WriteFault,
};
pub use queue::WorkQueue;
pub use reconciler::{LabelReconciler, ReconcileOutcome, ReconcilePlan};
pub use refresher::{CompatibilityRefresher, DocumentDigest, RefreshOutcome};
pub use source::{ConfigSource, FileConfigSource, FileFormat, MemoryConfigSource};

pub use nodelabel_core::{CompatibilityStore, DiskTypeSet, MachineFamily, NodeLabelSet};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cancel::{cancellation, Cancellation};
    pub use crate::config::{ControllerConfig, ControllerConfigBuilder};
    pub use crate::controller::{Controller, ControllerEvent};
    pub use crate::error::{NodeStoreError, ReconcileError};
    pub use crate::node_store::{MemoryNodeStore, NodeId, NodeStore};
    pub use crate::reconciler::{LabelReconciler, ReconcileOutcome};
    pub use crate::source::{ConfigSource, FileConfigSource, MemoryConfigSource};
    pub use nodelabel_core::labels::INSTANCE_TYPE_LABEL;
    pub use nodelabel_core::{CompatibilityStore, NodeLabelSet};
}
