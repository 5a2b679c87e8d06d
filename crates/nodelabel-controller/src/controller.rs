//! Scheduling driver around the reconciler.
//!
//! The controller owns everything the reconciler deliberately leaves to its
//! caller: which nodes to reconcile and when, retrying retryable failures
//! with exponential backoff, polling the compatibility source, and periodic
//! resyncs. It never runs two reconciles for the same node at once.

use crate::cancel::Cancellation;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, NodeStoreError, ReconcileError, RefreshError, Result};
use crate::node_store::{NodeId, NodeStore};
use crate::queue::WorkQueue;
use crate::reconciler::{LabelReconciler, ReconcileOutcome};
use crate::refresher::{CompatibilityRefresher, RefreshOutcome};
use crate::source::ConfigSource;
use futures::stream::{self, StreamExt};
use nodelabel_core::CompatibilityStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

/// Events emitted by the controller.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    /// A reconcile finished without error.
    Reconciled {
        node: NodeId,
        outcome: ReconcileOutcome,
    },
    /// A reconcile failed. `retry_in` is `None` when no retry is scheduled.
    ReconcileFailed {
        node: NodeId,
        error: ReconcileError,
        attempt: u32,
        retry_in: Option<Duration>,
    },
    /// A new compatibility mapping was applied.
    CompatibilityApplied { families: usize, generation: u64 },
    /// The compatibility document could not be fetched or parsed.
    RefreshFailed { error: RefreshError },
    /// Every node was queued.
    Resynced { nodes: usize },
}

/// Result of a one-shot pass over every node.
#[derive(Clone, Debug, Default)]
pub struct ReconcileReport {
    pub results: Vec<(NodeId, std::result::Result<ReconcileOutcome, ReconcileError>)>,
}

impl ReconcileReport {
    pub fn updated(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Ok(outcome) if outcome.changed()))
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Ok(outcome) if !outcome.changed()))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, result)| result.is_err()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// The node labeling controller.
pub struct Controller<N: NodeStore, S: ConfigSource> {
    config: ControllerConfig,
    reconciler: LabelReconciler<N>,
    refresher: CompatibilityRefresher<S>,
    queue: Arc<WorkQueue>,
    attempts: Mutex<HashMap<NodeId, u32>>,
    event_tx: broadcast::Sender<ControllerEvent>,
}

impl<N: NodeStore, S: ConfigSource> Controller<N, S> {
    /// Create a controller with a fresh, empty compatibility store.
    pub fn new(config: ControllerConfig, nodes: Arc<N>, source: Arc<S>) -> Result<Self> {
        Self::with_store(config, nodes, source, Arc::new(CompatibilityStore::new()))
    }

    /// Create a controller sharing an existing compatibility store.
    pub fn with_store(
        config: ControllerConfig,
        nodes: Arc<N>,
        source: Arc<S>,
        compatibility: Arc<CompatibilityStore>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        let reconciler = LabelReconciler::new(nodes, Arc::clone(&compatibility))
            .with_operation_timeout(config.operation_timeout());
        let refresher = CompatibilityRefresher::new(source, compatibility);

        Ok(Self {
            config,
            reconciler,
            refresher,
            queue: Arc::new(WorkQueue::new()),
            attempts: Mutex::new(HashMap::new()),
            event_tx,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn reconciler(&self) -> &LabelReconciler<N> {
        &self.reconciler
    }

    pub fn refresher(&self) -> &CompatibilityRefresher<S> {
        &self.refresher
    }

    pub fn compatibility(&self) -> &Arc<CompatibilityStore> {
        self.reconciler.compatibility()
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Subscribe to controller events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    /// Queue one node for reconciliation.
    pub fn enqueue(&self, id: NodeId) -> bool {
        self.queue.enqueue(id)
    }

    /// Queue every node in the store. Returns how many were listed.
    pub async fn enqueue_all(&self) -> Result<usize> {
        let ids = self.list_nodes().await?;
        let count = ids.len();
        for id in ids {
            self.queue.enqueue(id);
        }
        Ok(count)
    }

    /// Refresh the compatibility mapping; re-queue every node when it changed.
    pub async fn refresh(&self) -> std::result::Result<RefreshOutcome, RefreshError> {
        match self.refresher.refresh().await {
            Ok(outcome) => {
                if let RefreshOutcome::Applied { summary, .. } = &outcome {
                    self.emit(ControllerEvent::CompatibilityApplied {
                        families: summary.families,
                        generation: summary.generation,
                    });
                    if let Err(err) = self.enqueue_all().await {
                        tracing::warn!(error = %err, "could not queue nodes after compatibility change");
                    }
                }
                Ok(outcome)
            }
            Err(error) => {
                self.emit(ControllerEvent::RefreshFailed {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Reconcile every node once with bounded concurrency. No retries.
    pub async fn reconcile_all(&self, cancel: &Cancellation) -> Result<ReconcileReport> {
        let ids = self.list_nodes().await?;

        let mut results: Vec<_> = stream::iter(ids)
            .map(|id| {
                let mut cancel = cancel.clone();
                async move {
                    let result = self.reconciler.reconcile_with(&id, &mut cancel).await;
                    (id, result)
                }
            })
            .buffer_unordered(self.config.workers)
            .collect()
            .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        let report = ReconcileReport { results };
        tracing::info!(
            nodes = report.results.len(),
            updated = report.updated(),
            failed = report.failed(),
            "reconciled all nodes"
        );
        Ok(report)
    }

    /// Run until `shutdown` fires.
    ///
    /// Performs an initial refresh and full enqueue, then runs the workers,
    /// the source poll loop and the resync loop.
    pub async fn run(self: Arc<Self>, shutdown: Cancellation) -> Result<()> {
        if let Err(err) = self.refresh().await {
            tracing::warn!(error = %err, "initial compatibility refresh failed, starting with current mapping");
        }
        let listed = self.enqueue_all().await?;
        tracing::info!(
            nodes = listed,
            workers = self.config.workers,
            "node labeler controller started"
        );

        let mut tasks = Vec::new();
        for worker in 0..self.config.workers {
            tasks.push(tokio::spawn(
                Arc::clone(&self).worker(worker, shutdown.clone()),
            ));
        }
        if let Some(interval) = self.config.config_poll_interval() {
            tasks.push(tokio::spawn(
                Arc::clone(&self).poll_loop(interval, shutdown.clone()),
            ));
        }
        if let Some(interval) = self.config.resync_interval() {
            tasks.push(tokio::spawn(
                Arc::clone(&self).resync_loop(interval, shutdown.clone()),
            ));
        }

        let mut shutdown = shutdown;
        shutdown.cancelled().await;
        self.queue.shutdown();

        for result in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "controller task panicked");
            }
        }
        tracing::info!("node labeler controller stopped");
        Ok(())
    }

    async fn worker(self: Arc<Self>, worker: usize, mut shutdown: Cancellation) {
        loop {
            let id = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.queue.next() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let result = self.reconciler.reconcile_with(&id, &mut shutdown).await;
            self.handle_result(worker, &id, result);
            self.queue.done(&id);
        }
        tracing::debug!(worker, "worker stopped");
    }

    fn handle_result(
        &self,
        worker: usize,
        id: &NodeId,
        result: std::result::Result<ReconcileOutcome, ReconcileError>,
    ) {
        let error = match result {
            Ok(outcome) => {
                self.attempts.lock().remove(id);
                self.emit(ControllerEvent::Reconciled {
                    node: id.clone(),
                    outcome,
                });
                return;
            }
            Err(ReconcileError::Cancelled { .. }) => return,
            Err(error) => error,
        };

        let attempt = {
            let mut attempts = self.attempts.lock();
            let attempt = attempts.entry(id.clone()).or_insert(0);
            *attempt += 1;
            *attempt
        };

        let retry_in = if error.is_retryable() && attempt < self.config.retry.max_attempts {
            let delay = self.config.retry.backoff(attempt);
            tracing::warn!(worker, node = %id, attempt, delay_ms = delay.as_millis() as u64, error = %error, "reconcile failed, retrying");
            self.requeue_after(id.clone(), delay);
            Some(delay)
        } else {
            self.attempts.lock().remove(id);
            tracing::error!(worker, node = %id, attempt, error = %error, "reconcile failed, giving up until next resync");
            None
        };

        self.emit(ControllerEvent::ReconcileFailed {
            node: id.clone(),
            error,
            attempt,
            retry_in,
        });
    }

    fn requeue_after(&self, id: NodeId, delay: Duration) {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(id);
        });
    }

    async fn poll_loop(self: Arc<Self>, interval: Duration, mut shutdown: Cancellation) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial refresh already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.refresh().await;
                }
            }
        }
    }

    async fn resync_loop(self: Arc<Self>, interval: Duration, mut shutdown: Cancellation) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.enqueue_all().await {
                    Ok(nodes) => {
                        tracing::debug!(nodes, "resync queued all nodes");
                        self.emit(ControllerEvent::Resynced { nodes });
                    }
                    Err(err) => tracing::warn!(error = %err, "resync failed"),
                },
            }
        }
    }

    async fn list_nodes(&self) -> Result<Vec<NodeId>> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, self.reconciler.node_store().list_nodes()).await {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(err)) => Err(ControllerError::ListNodes(err)),
            Err(_) => Err(ControllerError::ListNodes(NodeStoreError::Unavailable(
                format!("list_nodes timed out after {:?}", timeout),
            ))),
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }
}
