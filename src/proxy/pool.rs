//! Registered backend set with the shared round-robin cursor and the
//! primary index.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::proxy::backend::Endpoint;

/// Process-wide set of registered backends. Append-only in registration
/// order; iteration works on a snapshot so registration never blocks
/// dispatch or heartbeat passes. Backends are never removed; failure only
/// toggles their liveness flag.
#[derive(Debug, Default)]
pub(crate) struct BackendPool {
    /// Registration-ordered backend handles.
    backends: RwLock<Vec<Arc<dyn Endpoint>>>,

    /// Monotonic round-robin cursor; `cursor mod |S|` picks the next
    /// candidate. Incremented on every selection attempt, including skips
    /// over dead replicas, so fairness is preserved across calls.
    cursor: AtomicU64,

    /// Index of the primary replica used as the replay reference. Written
    /// only by the heartbeat task.
    primary: AtomicUsize,
}

impl BackendPool {
    /// Creates an empty pool.
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Appends a newly registered backend at the tail.
    pub(crate) fn register(&self, backend: Arc<dyn Endpoint>) {
        self.backends.write().unwrap().push(backend);
    }

    /// Snapshot of the current backend sequence.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Endpoint>> {
        self.backends.read().unwrap().clone()
    }

    /// Atomically advances the shared cursor, returning its pre-increment
    /// value.
    pub(crate) fn next_cursor(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Current primary index. Meaningless while the pool is empty.
    pub(crate) fn primary(&self) -> usize {
        self.primary.load(Ordering::Relaxed)
    }

    /// Fails the primary role over to the slot after `failed_idx`.
    pub(crate) fn fail_over_primary(
        &self,
        failed_idx: usize,
        population: usize,
    ) {
        self.primary
            .store((failed_idx + 1) % population, Ordering::Relaxed);
    }
}
