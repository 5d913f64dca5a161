//! Periodic backend liveness probing, primary failover, and recovery
//! replay.

use std::sync::Arc;

use crate::proxy::backend::Endpoint;
use crate::proxy::journal::Journal;
use crate::proxy::pool::BackendPool;
use crate::utils::ProxyError;

use tokio::time::{self, Duration, MissedTickBehavior};

/// The membership and heartbeat manager, run as a single periodic task.
#[derive(Debug)]
pub(crate) struct Heartbeater {
    pool: Arc<BackendPool>,
    journal: Arc<Journal>,
    period: Duration,
}

impl Heartbeater {
    pub(crate) fn new(
        pool: Arc<BackendPool>,
        journal: Arc<Journal>,
        period: Duration,
    ) -> Self {
        Heartbeater {
            pool,
            journal,
            period,
        }
    }

    /// Heartbeat main loop; never returns.
    pub(crate) async fn run(self) {
        let mut interval = time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pf_debug!("heartbeat task spawned");

        loop {
            interval.tick().await;
            self.check_backends().await;
        }
    }

    /// One probing pass over a snapshot of the backend set. A replica that
    /// fails its probe goes dead (taking the primary role with it, which
    /// fails over positionally); a fresh replica that probes alive is first
    /// resynchronized from the journal before rejoining the rotation.
    pub(crate) async fn check_backends(&self) {
        let backends = self.pool.snapshot();
        let population = backends.len();

        for (idx, backend) in backends.iter().enumerate() {
            let primary = self.pool.primary();
            let ok = backend.probe().await;

            if !ok {
                if backend.is_alive() {
                    pf_warn!(
                        "backend '{}' failed probe, marking dead",
                        backend.addr()
                    );
                }
                backend.mark_dead();
                if idx == primary {
                    self.pool.fail_over_primary(idx, population);
                    pf_warn!(
                        "primary failed over to index {}",
                        self.pool.primary()
                    );
                }
            } else if !backend.is_synced() && idx != primary && population > 1
            {
                match self.replay_journal(backend.as_ref(), &backends).await {
                    Ok(()) => {
                        backend.mark_synced();
                        backend.mark_alive();
                        pf_info!(
                            "backend '{}' resynced, rejoining rotation",
                            backend.addr()
                        );
                    }
                    Err(e) => {
                        // left dead and fresh; retried on the next tick
                        pf_warn!(
                            "resync of backend '{}' failed: {}",
                            backend.addr(),
                            e
                        );
                        backend.mark_dead();
                    }
                }
            } else {
                backend.mark_alive();
            }
        }
    }

    /// Replays the full journal to a recovered backend, entry by entry in
    /// order, no ACKs awaited. Entries are assumed idempotent on the backend
    /// side. A transport error aborts this pass.
    async fn replay_journal(
        &self,
        backend: &dyn Endpoint,
        backends: &[Arc<dyn Endpoint>],
    ) -> Result<(), ProxyError> {
        let entries = self.journal.tail_from(0);
        let source = backends
            .get(self.pool.primary())
            .map(|b| b.addr().to_string())
            .unwrap_or_default();
        pf_info!(
            "resyncing backend '{}' with {} journal entries (primary '{}')",
            backend.addr(),
            entries.len(),
            source
        );
        for entry in &entries {
            backend.replay_entry(entry).await?;
        }
        Ok(())
    }
}
