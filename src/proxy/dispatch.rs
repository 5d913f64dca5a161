//! Request dispatcher: journal append plus round-robin forwarding with
//! bounded retry and failover across backends.

use std::sync::Arc;

use crate::proxy::journal::Journal;
use crate::proxy::pool::BackendPool;
use crate::proxy::wire::{ERR_ALL_BACKENDS_DOWN, ERR_NO_BACKENDS};

/// Forwards client requests to live backends. Cheap to clone; all state is
/// shared behind `Arc`s.
#[derive(Debug, Clone)]
pub(crate) struct Dispatcher {
    pool: Arc<BackendPool>,
    journal: Arc<Journal>,
}

impl Dispatcher {
    pub(crate) fn new(pool: Arc<BackendPool>, journal: Arc<Journal>) -> Self {
        Dispatcher { pool, journal }
    }

    /// Forwards `request` to the next live backend, failing over across the
    /// whole set at most once. Always returns a reply line: the backend
    /// response on success, a literal error token otherwise; transport
    /// failures never escape to the caller. The request is journaled exactly
    /// once per call, before the first network attempt, so a later replay
    /// covers it even if every forward attempt fails.
    pub(crate) async fn forward(&self, request: &str) -> String {
        self.journal.append(request);

        let backends = self.pool.snapshot();
        let population = backends.len();
        if population == 0 {
            pf_warn!("no backends registered, dropping request");
            return ERR_NO_BACKENDS.into();
        }

        for _ in 0..population {
            let idx =
                (self.pool.next_cursor() % population as u64) as usize;
            let backend = &backends[idx];
            if !backend.is_alive() {
                continue;
            }
            match backend.send_and_await_ack(request).await {
                Ok(reply) => {
                    pf_trace!("forwarded to backend '{}'", backend.addr());
                    return reply;
                }
                Err(e) => {
                    pf_warn!(
                        "backend '{}' failed, marking dead: {}",
                        backend.addr(),
                        e
                    );
                    backend.mark_dead();
                }
            }
        }

        pf_warn!("all {} backends exhausted", population);
        ERR_ALL_BACKENDS_DOWN.into()
    }
}
