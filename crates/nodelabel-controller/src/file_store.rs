//! JSON-file backed node store.
//!
//! The inventory file has the shape:
//!
//! ```text
//! { "nodes": { "<name>": { "labels": { ... }, "resourceVersion": 3 } } }
//! ```
//!
//! Writes go to a sibling temporary file which is then renamed over the
//! inventory, so a reader never sees a half-written file. All operations of
//! one store instance are serialized through an async mutex.

use crate::error::NodeStoreError;
use crate::node_store::{NodeId, NodeSnapshot, NodeStore, ResourceVersion};
use async_trait::async_trait;
use nodelabel_core::NodeLabelSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeInventory {
    #[serde(default)]
    nodes: BTreeMap<NodeId, NodeSnapshot>,
}

/// Node store persisted as a JSON inventory file.
pub struct FileNodeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileNodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<NodeInventory, NodeStoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(NodeInventory::default()),
            Err(err) => {
                return Err(NodeStoreError::Unavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    err
                )))
            }
        };

        serde_json::from_slice(&raw).map_err(|err| {
            NodeStoreError::Unavailable(format!("{}: corrupt inventory: {}", self.path.display(), err))
        })
    }

    async fn save(&self, node: &NodeId, inventory: &NodeInventory) -> Result<(), NodeStoreError> {
        let bytes = serde_json::to_vec_pretty(inventory).map_err(|err| NodeStoreError::Rejected {
            node: node.clone(),
            reason: err.to_string(),
        })?;

        // I/O failures on save are transient for the caller, the same as on load.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|err| NodeStoreError::Unavailable(format!("{}: {}", tmp.display(), err)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|err| {
            NodeStoreError::Unavailable(format!("{}: {}", self.path.display(), err))
        })
    }
}

#[async_trait]
impl NodeStore for FileNodeStore {
    async fn get_node(&self, id: &NodeId) -> Result<NodeSnapshot, NodeStoreError> {
        let _guard = self.lock.lock().await;
        let mut inventory = self.load().await?;
        inventory
            .nodes
            .remove(id)
            .ok_or_else(|| NodeStoreError::NotFound(id.clone()))
    }

    async fn update_node_labels(
        &self,
        id: &NodeId,
        labels: NodeLabelSet,
        expected: ResourceVersion,
    ) -> Result<ResourceVersion, NodeStoreError> {
        let _guard = self.lock.lock().await;
        let mut inventory = self.load().await?;

        let node = inventory
            .nodes
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
        let version = node.resource_version;

        self.save(id, &inventory).await?;
        Ok(version)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeId>, NodeStoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.nodes.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;

    const INVENTORY: &str = r#"{
        "nodes": {
            "node-a": { "labels": { "node.kubernetes.io/instance-type": "e2-medium" }, "resourceVersion": 4 },
            "node-b": { "labels": {} }
        }
    }"#;

    #[tokio::test]
    async fn test_read_update_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        tokio::fs::write(&path, INVENTORY).await.unwrap();
        let store = FileNodeStore::new(&path);
        let id = NodeId::new("node-a");

        let snapshot = store.get_node(&id).await.unwrap();
        assert_eq!(snapshot.resource_version, ResourceVersion(4));

        let mut labels = snapshot.labels.clone();
        labels.insert("disk-type.gke.io/pd-ssd".to_string(), "true".to_string());
        let version = store
            .update_node_labels(&id, labels.clone(), snapshot.resource_version)
            .await
            .unwrap();
        assert_eq!(version, ResourceVersion(5));

        let reread = FileNodeStore::new(&path).get_node(&id).await.unwrap();
        assert_eq!(reread.labels, labels);
        assert_eq!(reread.resource_version, ResourceVersion(5));

        let defaulted = store.get_node(&NodeId::new("node-b")).await.unwrap();
        assert_eq!(defaulted.resource_version, ResourceVersion(0));
    }

    #[tokio::test]
    async fn test_conflict_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        tokio::fs::write(&path, INVENTORY).await.unwrap();
        let store = FileNodeStore::new(&path);

        let err = store
            .update_node_labels(&NodeId::new("node-a"), NodeLabelSet::new(), ResourceVersion(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeStoreError::Conflict { .. }));

        let err = store.get_node(&NodeId::new("ghost")).await.unwrap_err();
        assert_eq!(err, NodeStoreError::NotFound(NodeId::new("ghost")));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_and_corrupt_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let store = FileNodeStore::new(&path);
        assert!(store.list_nodes().await.unwrap().is_empty());

        tokio::fs::write(&path, "{ nodes").await.unwrap();
        assert!(matches!(
            store.list_nodes().await,
            Err(NodeStoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_save_is_unavailable_and_retryable() {
        use crate::reconciler::LabelReconciler;
        use nodelabel_core::CompatibilityStore;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        tokio::fs::write(&path, INVENTORY).await.unwrap();
        tokio::fs::create_dir(path.with_extension("json.tmp")).await.unwrap();
        let store = Arc::new(FileNodeStore::new(&path));
        let id = NodeId::new("node-a");

        let err = store
            .update_node_labels(&id, NodeLabelSet::new(), ResourceVersion(4))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeStoreError::Unavailable(_)));

        let compatibility = CompatibilityStore::new();
        compatibility
            .refresh(br#"{ "e2": { "pd-ssd": true } }"#)
            .unwrap();
        let reconciler = LabelReconciler::new(Arc::clone(&store), Arc::new(compatibility));
        let err = reconciler.reconcile(&id).await.unwrap_err();
        assert!(matches!(err, ReconcileError::StoreUnavailable { .. }));
        assert!(err.is_retryable());

        let snapshot = store.get_node(&id).await.unwrap();
        assert_eq!(snapshot.resource_version, ResourceVersion(4));
    }
}
