//! Node store abstraction - the authoritative source of node labels.
//!
//! Updates use optimistic concurrency: every read returns a
//! [`ResourceVersion`] and a write only succeeds if the node still carries
//! that version. A stale write fails with [`NodeStoreError::Conflict`].

use crate::error::NodeStoreError;
use async_trait::async_trait;
use nodelabel_core::NodeLabelSet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Unique identifier (name) of a node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Version of a node object, bumped on every successful write.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(pub u64);

impl ResourceVersion {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Labels of a node as read from the store, with the version they were read at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    #[serde(default)]
    pub labels: NodeLabelSet,
    #[serde(default)]
    pub resource_version: ResourceVersion,
}

/// Abstract node store.
#[async_trait]
pub trait NodeStore: Send + Sync + 'static {
    /// Read a node's labels and current version.
    async fn get_node(&self, id: &NodeId) -> Result<NodeSnapshot, NodeStoreError>;

    /// Replace a node's labels if it is still at `expected`.
    ///
    /// Returns the new version on success.
    async fn update_node_labels(
        &self,
        id: &NodeId,
        labels: NodeLabelSet,
        expected: ResourceVersion,
    ) -> Result<ResourceVersion, NodeStoreError>;

    /// Identifiers of every node currently in the store.
    async fn list_nodes(&self) -> Result<Vec<NodeId>, NodeStoreError>;
}

/// Fault injected into the next read of a [`MemoryNodeStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadFault {
    Unavailable,
    Delay(Duration),
}

/// Fault injected into the next write of a [`MemoryNodeStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteFault {
    Unavailable,
    Rejected,
    Conflict,
    Delay(Duration),
}

/// In-memory node store for testing and simulation.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<BTreeMap<NodeId, NodeSnapshot>>,
    read_faults: Mutex<VecDeque<ReadFault>>,
    write_faults: Mutex<VecDeque<WriteFault>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with nodes at version 1.
    pub fn with_nodes<I, L>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, L)>,
        L: Into<NodeLabelSet>,
    {
        let store = Self::new();
        for (id, labels) in nodes {
            store.insert_node(id, labels.into());
        }
        store
    }

    /// Create or replace a node, bumping its version.
    pub fn insert_node(&self, id: NodeId, labels: NodeLabelSet) -> ResourceVersion {
        let mut nodes = self.nodes.write();
        let version = nodes
            .get(&id)
            .map(|node| node.resource_version.next())
            .unwrap_or(ResourceVersion(1));
        nodes.insert(
            id,
            NodeSnapshot {
                labels,
                resource_version: version,
            },
        );
        version
    }

    pub fn remove_node(&self, id: &NodeId) -> Option<NodeSnapshot> {
        self.nodes.write().remove(id)
    }

    /// Current labels of a node, bypassing fault injection.
    pub fn labels(&self, id: &NodeId) -> Option<NodeLabelSet> {
        self.nodes.read().get(id).map(|node| node.labels.clone())
    }

    pub fn resource_version(&self, id: &NodeId) -> Option<ResourceVersion> {
        self.nodes.read().get(id).map(|node| node.resource_version)
    }

    pub fn fail_next_read(&self, fault: ReadFault) {
        self.read_faults.lock().push_back(fault);
    }

    pub fn fail_next_write(&self, fault: WriteFault) {
        self.write_faults.lock().push_back(fault);
    }

    /// Number of `get_node` calls served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful label updates.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_node(&self, id: &NodeId) -> Result<NodeSnapshot, NodeStoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        let fault = self.read_faults.lock().pop_front();
        match fault {
            Some(ReadFault::Unavailable) => {
                return Err(NodeStoreError::Unavailable(
                    "injected read failure".to_string(),
                ))
            }
            Some(ReadFault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NodeStoreError::NotFound(id.clone()))
    }

    async fn update_node_labels(
        &self,
        id: &NodeId,
        labels: NodeLabelSet,
        expected: ResourceVersion,
    ) -> Result<ResourceVersion, NodeStoreError> {
        let fault = self.write_faults.lock().pop_front();
        match fault {
            Some(WriteFault::Unavailable) => {
                return Err(NodeStoreError::Unavailable(
                    "injected write failure".to_string(),
                ))
            }
            Some(WriteFault::Rejected) => {
                return Err(NodeStoreError::Rejected {
                    node: id.clone(),
                    reason: "injected rejection".to_string(),
                })
            }
            Some(WriteFault::Conflict) => {
                return Err(NodeStoreError::Conflict {
                    node: id.clone(),
                    expected,
                    actual: expected.next(),
                })
            }
            Some(WriteFault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| NodeStoreError::NotFound(id.clone()))?;

        if node.resource_version != expected {
            return Err(NodeStoreError::Conflict {
                node: id.clone(),
                expected,
                actual: node.resource_version,
            });
        }

        node.labels = labels;
        node.resource_version = node.resource_version.next();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(node.resource_version)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeId>, NodeStoreError> {
        Ok(self.nodes.read().keys().cloned().collect())
    }
}
