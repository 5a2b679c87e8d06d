//! De-duplicating work queue of node identifiers.
//!
//! Semantics follow the usual controller work queue:
//! - an id queued several times before it is picked up is delivered once
//! - an id is never handed to two workers at the same time
//! - an id queued while it is being processed is delivered again after
//!   [`WorkQueue::done`]

use crate::node_store::NodeId;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc;

#[derive(Default)]
struct QueueState {
    dirty: HashSet<NodeId>,
    processing: HashSet<NodeId>,
    shut_down: bool,
}

/// Work queue shared by the controller's workers.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    tx: mpsc::UnboundedSender<NodeId>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<NodeId>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(QueueState::default()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Queue an id. Returns false if it was already waiting or the queue is shut down.
    pub fn enqueue(&self, id: NodeId) -> bool {
        let mut state = self.state.lock();
        if state.shut_down || state.dirty.contains(&id) {
            return false;
        }
        state.dirty.insert(id.clone());
        if !state.processing.contains(&id) {
            let _ = self.tx.send(id);
        }
        true
    }

    /// Wait for the next id to process; `None` once shut down.
    pub async fn next(&self) -> Option<NodeId> {
        let id = self.rx.lock().await.recv().await?;

        let mut state = self.state.lock();
        if state.shut_down {
            // Pass the wake-up on to the next blocked receiver.
            let _ = self.tx.send(NodeId::new(""));
            return None;
        }
        state.dirty.remove(&id);
        state.processing.insert(id.clone());
        Some(id)
    }

    /// Mark an id as processed, re-delivering it if it was queued meanwhile.
    pub fn done(&self, id: &NodeId) {
        let mut state = self.state.lock();
        state.processing.remove(id);
        if !state.shut_down && state.dirty.contains(id) {
            let _ = self.tx.send(id.clone());
        }
    }

    /// Stop accepting and delivering ids.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        state.dirty.clear();
        // Wake receivers blocked in `next`; the id itself is discarded.
        let _ = self.tx.send(NodeId::new(""));
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Ids waiting to be picked up.
    pub fn len(&self) -> usize {
        self.state.lock().dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids currently being processed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().processing.len()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
