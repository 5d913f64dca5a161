//! In-memory append-only journal of forwarded requests, replayed to
//! replicas returning from failure.

use std::sync::Mutex;

/// Ordered log of encoded requests. Contains every request the proxy has
/// attempted to replicate, irrespective of forwarding success, so a replayed
/// replica never misses a request any other replica may have observed. No
/// deduplication, no durability.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    /// Creates an empty journal.
    pub(crate) fn new() -> Self {
        Journal {
            entries: Mutex::new(vec![]),
        }
    }

    /// Appends one entry at the tail.
    pub(crate) fn append(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    /// Returns a snapshot copy of all entries from `offset` on, so replay
    /// can iterate without blocking writers. Offset 0 yields the full
    /// journal; offsets past the end yield an empty sequence.
    pub(crate) fn tail_from(&self, offset: usize) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        if offset >= entries.len() {
            vec![]
        } else {
            entries[offset..].to_vec()
        }
    }

    /// Number of entries appended so far.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
