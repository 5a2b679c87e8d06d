//! Error types for the controller layer.

use crate::node_store::{NodeId, ResourceVersion};
use nodelabel_core::ParseError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a [`NodeStore`](crate::node_store::NodeStore).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeStoreError {
    #[error("Node not found: {0}")]
    NotFound(NodeId),

    #[error("Conflict updating node {node}: expected version {expected}, found {actual}")]
    Conflict {
        node: NodeId,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    #[error("Node store unavailable: {0}")]
    Unavailable(String),

    #[error("Node store rejected update of {node}: {reason}")]
    Rejected { node: NodeId, reason: String },
}

/// Errors returned by a [`ConfigSource`](crate::source::ConfigSource).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Failed to read compatibility document from {location}: {reason}")]
    Io { location: String, reason: String },

    #[error("Unreadable ConfigMap manifest {location}: {reason}")]
    Manifest { location: String, reason: String },
}

/// Errors returned while refreshing the compatibility store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Errors returned by a single reconcile attempt.
///
/// A missing node is not an error; see
/// [`ReconcileOutcome::NodeNotFound`](crate::reconciler::ReconcileOutcome::NodeNotFound).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Node {node} was modified concurrently")]
    Conflict { node: NodeId },

    #[error("Node store unavailable while reconciling {node}: {reason}")]
    StoreUnavailable { node: NodeId, reason: String },

    #[error("Failed to write labels of {node}: {reason}")]
    Write { node: NodeId, reason: String },

    #[error("{operation} for node {node} timed out after {after:?}")]
    Timeout {
        node: NodeId,
        operation: &'static str,
        after: Duration,
    },

    #[error("Reconcile of node {node} was cancelled")]
    Cancelled { node: NodeId },
}

impl ReconcileError {
    /// Whether the scheduling layer should try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Conflict { .. }
                | ReconcileError::StoreUnavailable { .. }
                | ReconcileError::Timeout { .. }
        )
    }

    pub fn node(&self) -> &NodeId {
        match self {
            ReconcileError::Conflict { node }
            | ReconcileError::StoreUnavailable { node, .. }
            | ReconcileError::Write { node, .. }
            | ReconcileError::Timeout { node, .. }
            | ReconcileError::Cancelled { node } => node,
        }
    }
}

/// Errors returned by the controller driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("Failed to list nodes: {0}")]
    ListNodes(NodeStoreError),

    #[error("Invalid controller configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load controller configuration: {0}")]
    ConfigLoad(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
