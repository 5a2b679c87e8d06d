//! Integration tests for single-node reconciliation.
//!
//! Tests cover:
//! - Labels added from a ConfigMap-provided mapping
//! - Pre-existing labels survive reconciliation
//! - Reconciling a missing node is a no-op
//! - Idempotence, refresh atomicity and unknown families

use nodelabel_controller::{
    CompatibilityRefresher, CompatibilityStore, ConfigSource, FileConfigSource, LabelReconciler,
    MemoryConfigSource, MemoryNodeStore, NodeId, NodeLabelSet, ReconcileOutcome, RefreshError,
};
use nodelabel_core::labels::{disk_type_label_key, INSTANCE_TYPE_LABEL};
use std::collections::BTreeMap;
use std::sync::Arc;

const E2_DOCUMENT: &str = r#"{
    "e2": { "pd-standard": true, "pd-ssd": true }
}"#;

fn labels(pairs: &[(&str, &str)]) -> NodeLabelSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn disk(disk_type: &str) -> String {
    disk_type_label_key(disk_type)
}

/// Write a ConfigMap manifest carrying `document` and refresh a store from it.
async fn store_from_config_map(
    dir: &tempfile::TempDir,
    document: &str,
) -> Result<Arc<CompatibilityStore>, RefreshError> {
    let mut data = BTreeMap::new();
    data.insert("machine-pd-compatibility.json", document);
    let manifest = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "machine-pd-compatibility", "namespace": "gce-pd-csi-driver" },
        "data": data,
    });
    let path = dir.path().join("configmap.json");
    std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();

    let source = Arc::new(FileConfigSource::config_map(
        &path,
        "machine-pd-compatibility.json",
    ));
    let store = Arc::new(CompatibilityStore::new());
    let refresher = CompatibilityRefresher::new(source, Arc::clone(&store));
    refresher.refresh().await?;
    Ok(store)
}

fn reconciler_for(
    nodes: &Arc<MemoryNodeStore>,
    store: &Arc<CompatibilityStore>,
) -> LabelReconciler<MemoryNodeStore> {
    LabelReconciler::new(Arc::clone(nodes), Arc::clone(store))
}

#[tokio::test]
async fn test_adds_labels_to_node() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_from_config_map(&dir, E2_DOCUMENT).await.unwrap();
    let node = NodeId::new("test-node");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]),
    )]));

    let outcome = reconciler_for(&nodes, &store).reconcile(&node).await.unwrap();
    assert!(outcome.changed());

    let expected = labels(&[
        (INSTANCE_TYPE_LABEL, "e2-medium"),
        (disk("pd-standard").as_str(), "true"),
        (disk("pd-ssd").as_str(), "true"),
    ]);
    assert_eq!(nodes.labels(&node).unwrap(), expected);
}

#[tokio::test]
async fn test_keeps_labels_already_present() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_from_config_map(&dir, E2_DOCUMENT).await.unwrap();
    let node = NodeId::new("test-node");
    let initial = labels(&[
        (INSTANCE_TYPE_LABEL, "e2-medium"),
        (disk("pd-standard").as_str(), "true"),
        (disk("pd-ssd").as_str(), "true"),
        (disk("pd-extreme").as_str(), "true"),
    ]);
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(node.clone(), initial.clone())]));

    let outcome = reconciler_for(&nodes, &store).reconcile(&node).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Converged);
    assert_eq!(nodes.labels(&node).unwrap(), initial);
    assert_eq!(nodes.write_count(), 0);
}

#[tokio::test]
async fn test_missing_node_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_from_config_map(&dir, "{}").await.unwrap();
    let nodes = Arc::new(MemoryNodeStore::new());

    let outcome = reconciler_for(&nodes, &store)
        .reconcile(&NodeId::new("non-existent-node"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NodeNotFound);
    assert!(!outcome.changed());
    assert_eq!(nodes.write_count(), 0);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let store = Arc::new(CompatibilityStore::new());
    store.refresh(E2_DOCUMENT.as_bytes()).unwrap();
    let node = NodeId::new("node-a");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[(INSTANCE_TYPE_LABEL, "e2-standard-8"), ("team", "storage")]),
    )]));
    let reconciler = reconciler_for(&nodes, &store);

    assert!(reconciler.reconcile(&node).await.unwrap().changed());
    let after_first = nodes.labels(&node).unwrap();

    assert!(!reconciler.reconcile(&node).await.unwrap().changed());
    assert_eq!(nodes.labels(&node).unwrap(), after_first);
    assert_eq!(nodes.write_count(), 1);
}

#[tokio::test]
async fn test_stale_disk_label_is_preserved() {
    let store = Arc::new(CompatibilityStore::new());
    store.refresh(E2_DOCUMENT.as_bytes()).unwrap();
    let node = NodeId::new("node-a");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[
            (INSTANCE_TYPE_LABEL, "e2-medium"),
            (disk("pd-extreme").as_str(), "true"),
        ]),
    )]));

    let outcome = reconciler_for(&nodes, &store).reconcile(&node).await.unwrap();
    match outcome {
        ReconcileOutcome::Updated { labels_set, .. } => {
            assert_eq!(labels_set, vec![disk("pd-ssd"), disk("pd-standard")]);
        }
        other => panic!("expected an update, got {:?}", other),
    }

    let current = nodes.labels(&node).unwrap();
    assert_eq!(current[&disk("pd-extreme")], "true");
    assert_eq!(current[&disk("pd-standard")], "true");
    assert_eq!(current[&disk("pd-ssd")], "true");
}

#[tokio::test]
async fn test_malformed_refresh_keeps_previous_mapping() {
    let source = Arc::new(MemoryConfigSource::with_document(E2_DOCUMENT));
    let store = Arc::new(CompatibilityStore::new());
    let refresher = CompatibilityRefresher::new(Arc::clone(&source), Arc::clone(&store));
    refresher.refresh().await.unwrap();
    let before = store.lookup("e2");

    source.set_document(r#"{ "e2": { "pd-ssd": "yes" } "#);
    assert!(matches!(
        refresher.refresh().await,
        Err(RefreshError::Parse(_))
    ));
    assert_eq!(store.lookup("e2"), before);
    assert!(store.lookup("e2").unwrap().contains("pd-standard"));

    // Reconciling against the kept mapping still works.
    let node = NodeId::new("node-a");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[(INSTANCE_TYPE_LABEL, "e2-micro")]),
    )]));
    assert!(reconciler_for(&nodes, &store)
        .reconcile(&node)
        .await
        .unwrap()
        .changed());
}

#[tokio::test]
async fn test_unknown_family_adds_nothing() {
    let store = Arc::new(CompatibilityStore::new());
    store.refresh(E2_DOCUMENT.as_bytes()).unwrap();
    let node = NodeId::new("node-a");
    let initial = labels(&[(INSTANCE_TYPE_LABEL, "c3-highmem-4")]);
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(node.clone(), initial.clone())]));

    let outcome = reconciler_for(&nodes, &store).reconcile(&node).await.unwrap();
    match &outcome {
        ReconcileOutcome::UnknownFamily(family) => assert_eq!(family.as_str(), "c3"),
        other => panic!("expected unknown family, got {:?}", other),
    }
    assert!(!outcome.changed());
    assert_eq!(nodes.labels(&node).unwrap(), initial);
}

#[tokio::test]
async fn test_absent_document_adds_no_labels() {
    let source = Arc::new(MemoryConfigSource::new());
    assert_eq!(source.fetch().await.unwrap(), None);
    let store = Arc::new(CompatibilityStore::new());
    CompatibilityRefresher::new(source, Arc::clone(&store))
        .refresh()
        .await
        .unwrap();
    assert!(store.snapshot().is_empty());

    let node = NodeId::new("node-a");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[(INSTANCE_TYPE_LABEL, "e2-medium")]),
    )]));
    let outcome = reconciler_for(&nodes, &store).reconcile(&node).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::UnknownFamily(_)));
}

#[tokio::test]
async fn test_new_mapping_adds_without_removing() {
    let store = Arc::new(CompatibilityStore::new());
    store.refresh(E2_DOCUMENT.as_bytes()).unwrap();
    let node = NodeId::new("node-a");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[(INSTANCE_TYPE_LABEL, "e2-medium"), ("owner", "infra")]),
    )]));
    let reconciler = reconciler_for(&nodes, &store);
    reconciler.reconcile(&node).await.unwrap();

    // pd-ssd drops out of the mapping, pd-balanced comes in.
    store
        .refresh(br#"{ "e2": { "pd-standard": true, "pd-ssd": false, "pd-balanced": true } }"#)
        .unwrap();
    let outcome = reconciler.reconcile(&node).await.unwrap();
    assert!(outcome.changed());

    let expected = labels(&[
        (INSTANCE_TYPE_LABEL, "e2-medium"),
        ("owner", "infra"),
        (disk("pd-standard").as_str(), "true"),
        (disk("pd-ssd").as_str(), "true"),
        (disk("pd-balanced").as_str(), "true"),
    ]);
    assert_eq!(nodes.labels(&node).unwrap(), expected);
}

#[tokio::test]
async fn test_node_without_instance_type_is_skipped() {
    let store = Arc::new(CompatibilityStore::new());
    store.refresh(E2_DOCUMENT.as_bytes()).unwrap();
    let node = NodeId::new("node-a");
    let nodes = Arc::new(MemoryNodeStore::with_nodes([(
        node.clone(),
        labels(&[("zone", "us-central1-a")]),
    )]));

    let outcome = reconciler_for(&nodes, &store).reconcile(&node).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::MissingInstanceType);
    assert_eq!(nodes.write_count(), 0);
}

#[tokio::test]
async fn test_concurrent_reconciles_of_different_nodes() {
    let store = Arc::new(CompatibilityStore::new());
    store.refresh(E2_DOCUMENT.as_bytes()).unwrap();
    let ids: Vec<NodeId> = (0..16).map(|i| NodeId::new(format!("node-{}", i))).collect();
    let nodes = Arc::new(MemoryNodeStore::with_nodes(ids.iter().map(|id| {
        (
            id.clone(),
            labels(&[(INSTANCE_TYPE_LABEL, "e2-medium"), ("id", id.as_str())]),
        )
    })));
    let reconciler = Arc::new(reconciler_for(&nodes, &store));

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.reconcile(&id).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().changed());
    }

    for id in &ids {
        let current = nodes.labels(id).unwrap();
        assert_eq!(current["id"], id.as_str());
        assert_eq!(current.len(), 4);
    }
}
