//! Converges one node's disk-type labels with the compatibility mapping.
//!
//! Each reconcile is a read-compute-compare-write cycle:
//!
//! 1. read the node and its resource version (a missing node is a no-op)
//! 2. derive the machine family from the instance-type label
//! 3. look up the family's compatible disk types
//! 4. merge the required labels without removing anything
//! 5. write back only when the merge changed something, guarded by the
//!    resource version read in step 1
//!
//! Conflicts, unavailability and timeouts are returned to the caller, which
//! owns retry policy. Nothing here retries on its own.

use crate::cancel::Cancellation;
use crate::error::{NodeStoreError, ReconcileError};
use crate::node_store::{NodeId, NodeStore, ResourceVersion};
use nodelabel_core::labels::INSTANCE_TYPE_LABEL;
use nodelabel_core::{CompatibilityStore, LabelMerge, MachineFamily, RequiredLabels};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default bound for a single node store operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What a successful reconcile did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Labels were written; lists the owned keys added or overwritten.
    Updated {
        labels_set: Vec<String>,
        resource_version: ResourceVersion,
    },
    /// The node already carries every required label.
    Converged,
    /// The node does not exist (or vanished before the write).
    NodeNotFound,
    /// The node has no instance-type label.
    MissingInstanceType,
    /// The instance-type label has no recognizable machine family.
    UnrecognizedInstanceType(String),
    /// The machine family has no entry in the compatibility mapping.
    UnknownFamily(MachineFamily),
}

impl ReconcileOutcome {
    /// Whether the node was written.
    pub fn changed(&self) -> bool {
        matches!(self, ReconcileOutcome::Updated { .. })
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileOutcome::Updated { labels_set, .. } => {
                write!(f, "updated {} label(s)", labels_set.len())
            }
            ReconcileOutcome::Converged => write!(f, "already converged"),
            ReconcileOutcome::NodeNotFound => write!(f, "node not found"),
            ReconcileOutcome::MissingInstanceType => write!(f, "no instance-type label"),
            ReconcileOutcome::UnrecognizedInstanceType(instance_type) => {
                write!(f, "unrecognized instance type {}", instance_type)
            }
            ReconcileOutcome::UnknownFamily(family) => {
                write!(f, "machine family {} not in compatibility mapping", family)
            }
        }
    }
}

/// What a reconcile would do, computed without writing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcilePlan {
    /// Nothing to write; the outcome is final.
    NoChange(ReconcileOutcome),
    /// The merged labels must be written at `resource_version`.
    Update {
        family: MachineFamily,
        merge: LabelMerge,
        resource_version: ResourceVersion,
    },
}

/// Reconciles node labels against a [`CompatibilityStore`].
pub struct LabelReconciler<N: NodeStore> {
    nodes: Arc<N>,
    compatibility: Arc<CompatibilityStore>,
    operation_timeout: Duration,
}

impl<N: NodeStore> LabelReconciler<N> {
    pub fn new(nodes: Arc<N>, compatibility: Arc<CompatibilityStore>) -> Self {
        Self {
            nodes,
            compatibility,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Bound every node store call by `timeout`.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn node_store(&self) -> &Arc<N> {
        &self.nodes
    }

    pub fn compatibility(&self) -> &Arc<CompatibilityStore> {
        &self.compatibility
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Converge one node's labels.
    pub async fn reconcile(&self, id: &NodeId) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_with(id, &mut Cancellation::never()).await
    }

    /// Converge one node's labels, aborting promptly when `cancel` fires.
    pub async fn reconcile_with(
        &self,
        id: &NodeId,
        cancel: &mut Cancellation,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let (family, merge, version) = match self.plan_with(id, cancel).await? {
            ReconcilePlan::NoChange(outcome) => {
                tracing::debug!(node = %id, outcome = %outcome, "no label update needed");
                return Ok(outcome);
            }
            ReconcilePlan::Update {
                family,
                merge,
                resource_version,
            } => (family, merge, resource_version),
        };

        let labels_set = merge.updated_keys().to_vec();
        let write = self.nodes.update_node_labels(id, merge.into_merged(), version);
        match self.bounded(id, "update_node_labels", write, cancel).await? {
            Ok(resource_version) => {
                tracing::info!(
                    node = %id,
                    family = %family,
                    labels = ?labels_set,
                    version = %resource_version,
                    "updated disk-type labels"
                );
                Ok(ReconcileOutcome::Updated {
                    labels_set,
                    resource_version,
                })
            }
            Err(NodeStoreError::NotFound(_)) => {
                tracing::debug!(node = %id, "node removed before labels were written");
                Ok(ReconcileOutcome::NodeNotFound)
            }
            Err(err) => Err(store_error(id, err)),
        }
    }

    /// Compute what [`reconcile`](Self::reconcile) would do without writing.
    pub async fn plan(&self, id: &NodeId) -> Result<ReconcilePlan, ReconcileError> {
        self.plan_with(id, &mut Cancellation::never()).await
    }

    pub async fn plan_with(
        &self,
        id: &NodeId,
        cancel: &mut Cancellation,
    ) -> Result<ReconcilePlan, ReconcileError> {
        let snapshot = match self
            .bounded(id, "get_node", self.nodes.get_node(id), cancel)
            .await?
        {
            Ok(snapshot) => snapshot,
            Err(NodeStoreError::NotFound(_)) => {
                return Ok(ReconcilePlan::NoChange(ReconcileOutcome::NodeNotFound))
            }
            Err(err) => return Err(store_error(id, err)),
        };

        let instance_type = match snapshot.labels.get(INSTANCE_TYPE_LABEL) {
            Some(instance_type) => instance_type,
            None => {
                return Ok(ReconcilePlan::NoChange(
                    ReconcileOutcome::MissingInstanceType,
                ))
            }
        };
        let family = match MachineFamily::from_instance_type(instance_type) {
            Some(family) => family,
            None => {
                return Ok(ReconcilePlan::NoChange(
                    ReconcileOutcome::UnrecognizedInstanceType(instance_type.clone()),
                ))
            }
        };

        let required = match self.compatibility.lookup(family.as_str()) {
            Some(disk_types) => RequiredLabels::for_disk_types(&disk_types),
            None => {
                return Ok(ReconcilePlan::NoChange(ReconcileOutcome::UnknownFamily(
                    family,
                )))
            }
        };

        let merge = required.merge_into(&snapshot.labels);
        if !merge.changed() {
            return Ok(ReconcilePlan::NoChange(ReconcileOutcome::Converged));
        }

        Ok(ReconcilePlan::Update {
            family,
            merge,
            resource_version: snapshot.resource_version,
        })
    }

    /// Run a store operation under the timeout and the cancellation signal.
    async fn bounded<T, F>(
        &self,
        id: &NodeId,
        operation: &'static str,
        fut: F,
        cancel: &mut Cancellation,
    ) -> Result<Result<T, NodeStoreError>, ReconcileError>
    where
        F: Future<Output = Result<T, NodeStoreError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReconcileError::Cancelled { node: id.clone() }),
            result = tokio::time::timeout(self.operation_timeout, fut) => {
                result.map_err(|_| ReconcileError::Timeout {
                    node: id.clone(),
                    operation,
                    after: self.operation_timeout,
                })
            }
        }
    }
}

fn store_error(node: &NodeId, err: NodeStoreError) -> ReconcileError {
    match err {
        NodeStoreError::Conflict { .. } => ReconcileError::Conflict { node: node.clone() },
        NodeStoreError::Unavailable(reason) => ReconcileError::StoreUnavailable {
            node: node.clone(),
            reason,
        },
        NodeStoreError::Rejected { reason, .. } => ReconcileError::Write {
            node: node.clone(),
            reason,
        },
        NodeStoreError::NotFound(_) => ReconcileError::StoreUnavailable {
            node: node.clone(),
            reason: "node vanished during operation".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use crate::node_store::{MemoryNodeStore, ReadFault, WriteFault};
    use nodelabel_core::NodeLabelSet;

    const E2_DOC: &[u8] = br#"{ "e2": { "pd-standard": true, "pd-ssd": true }, "a3": {} }"#;

    fn labels(pairs: &[(&str, &str)]) -> NodeLabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn reconciler(nodes: &[(&str, NodeLabelSet)]) -> LabelReconciler<MemoryNodeStore> {
        let store = MemoryNodeStore::with_nodes(
            nodes
                .iter()
                .map(|(id, labels)| (NodeId::new(*id), labels.clone())),
        );
        let compatibility = CompatibilityStore::new();
        compatibility.refresh(E2_DOC).unwrap();
        LabelReconciler::new(Arc::new(store), Arc::new(compatibility))
    }

    #[tokio::test]
    async fn test_plan_does_not_write() {
        let reconciler = reconciler(&[("node-a", labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]))]);
        let id = NodeId::new("node-a");

        match reconciler.plan(&id).await.unwrap() {
            ReconcilePlan::Update {
                family,
                merge,
                resource_version,
            } => {
                assert_eq!(family.as_str(), "e2");
                assert_eq!(merge.updated_keys().len(), 2);
                assert_eq!(resource_version, ResourceVersion(1));
            }
            other => panic!("expected update plan, got {:?}", other),
        }
        assert_eq!(reconciler.node_store().write_count(), 0);
    }

    #[tokio::test]
    async fn test_skip_reasons_are_distinguished() {
        let reconciler = reconciler(&[
            ("no-type", labels(&[("zone", "a")])),
            ("odd-type", labels(&[(INSTANCE_TYPE_LABEL, "weird")])),
            ("unknown", labels(&[(INSTANCE_TYPE_LABEL, "z9-huge")])),
            ("empty-family", labels(&[(INSTANCE_TYPE_LABEL, "a3-highgpu-8g")])),
        ]);

        let outcome = |id: &'static str| {
            let reconciler = &reconciler;
            async move { reconciler.reconcile(&NodeId::new(id)).await.unwrap() }
        };

        assert_eq!(outcome("no-type").await, ReconcileOutcome::MissingInstanceType);
        assert_eq!(
            outcome("odd-type").await,
            ReconcileOutcome::UnrecognizedInstanceType("weird".to_string())
        );
        assert_eq!(
            outcome("unknown").await,
            ReconcileOutcome::UnknownFamily(MachineFamily::from_instance_type("z9-huge").unwrap())
        );
        assert_eq!(outcome("empty-family").await, ReconcileOutcome::Converged);
        assert_eq!(outcome("ghost").await, ReconcileOutcome::NodeNotFound);
        assert_eq!(reconciler.node_store().write_count(), 0);
    }

    #[tokio::test]
    async fn test_store_errors_are_mapped() {
        let reconciler = reconciler(&[("node-a", labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]))]);
        let id = NodeId::new("node-a");
        let store = reconciler.node_store();

        store.fail_next_read(ReadFault::Unavailable);
        let err = reconciler.reconcile(&id).await.unwrap_err();
        assert!(matches!(err, ReconcileError::StoreUnavailable { .. }));
        assert!(err.is_retryable());

        store.fail_next_write(WriteFault::Conflict);
        let err = reconciler.reconcile(&id).await.unwrap_err();
        assert_eq!(err, ReconcileError::Conflict { node: id.clone() });
        assert!(err.is_retryable());

        store.fail_next_write(WriteFault::Rejected);
        let err = reconciler.reconcile(&id).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Write { .. }));
        assert!(!err.is_retryable());

        assert!(reconciler.reconcile(&id).await.unwrap().changed());
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let reconciler = reconciler(&[("node-a", labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]))])
            .with_operation_timeout(Duration::from_millis(20));
        let id = NodeId::new("node-a");

        reconciler
            .node_store()
            .fail_next_read(ReadFault::Delay(Duration::from_secs(5)));
        let err = reconciler.reconcile(&id).await.unwrap_err();
        assert_eq!(
            err,
            ReconcileError::Timeout {
                node: id.clone(),
                operation: "get_node",
                after: Duration::from_millis(20),
            }
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_pending_write() {
        let reconciler = reconciler(&[("node-a", labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]))]);
        let id = NodeId::new("node-a");
        reconciler
            .node_store()
            .fail_next_write(WriteFault::Delay(Duration::from_secs(5)));

        let (handle, mut cancel) = cancellation();
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        };
        let (result, _) = tokio::join!(reconciler.reconcile_with(&id, &mut cancel), canceller);

        assert_eq!(result.unwrap_err(), ReconcileError::Cancelled { node: id.clone() });
        assert_eq!(reconciler.node_store().write_count(), 0);
        assert!(!reconciler.node_store().labels(&id).unwrap().contains_key("disk-type.gke.io/pd-ssd"));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_touch_store() {
        let reconciler = reconciler(&[("node-a", labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]))]);
        let (handle, mut cancel) = cancellation();
        handle.cancel();

        let err = reconciler
            .reconcile_with(&NodeId::new("node-a"), &mut cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled { .. }));
        assert_eq!(reconciler.node_store().read_count(), 0);
    }

    #[tokio::test]
    async fn test_node_removed_before_write_is_not_found() {
        let reconciler = reconciler(&[("node-a", labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]))]);
        let id = NodeId::new("node-a");
        let store = Arc::clone(reconciler.node_store());
        store.fail_next_write(WriteFault::Delay(Duration::from_millis(50)));

        let remover = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.remove_node(&id);
        };
        let (result, _) = tokio::join!(reconciler.reconcile(&id), remover);

        assert_eq!(result.unwrap(), ReconcileOutcome::NodeNotFound);
    }
}
