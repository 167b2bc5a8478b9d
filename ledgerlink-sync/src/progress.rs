//! Progress fan-out.
//!
//! One bus per process. Publishing is non-blocking: subscribers get a
//! broadcast receiver, and a slow or disconnected subscriber loses events
//! rather than stalling the reconciliation loop. A snapshot map keeps the
//! latest per-kind state for late subscribers.

use ledgerlink_types::{EntityKind, ProgressEvent, ProgressState};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Multi-subscriber progress bus.
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
    snapshot: RwLock<HashMap<EntityKind, ProgressState>>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes to subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Never blocks; send errors (no subscribers) are
    /// ignored.
    pub fn publish(&self, event: ProgressEvent) {
        if let ProgressEvent::KindProgress { kind, state } = &event {
            if let Ok(mut snap) = self.snapshot.write() {
                snap.insert(*kind, state.clone());
            }
        }
        let _ = self.tx.send(event);
    }

    /// Latest per-kind state, for late subscribers and polling callers.
    pub fn snapshot(&self) -> HashMap<EntityKind, ProgressState> {
        self.snapshot
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
