//! Worker liveness and lease reclamation.
//!
//! Liveness is derived from heartbeat age at query time; nothing is stored.
//! Reclaiming expired leases is the only path by which a crashed worker's
//! tasks get back into the queue.

use chrono::Duration;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{Capabilities, Worker};
use crate::store::Store;
use crate::store::tasks::ReclaimReport;

/// Reclaims allowed before a task is failed instead of re-queued.
pub const DEFAULT_MAX_RECLAIMS: u32 = 10;

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    store: Store,
    max_reclaims: u32,
}

impl HealthMonitor {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            max_reclaims: DEFAULT_MAX_RECLAIMS,
        }
    }

    pub fn with_max_reclaims(mut self, max_reclaims: u32) -> Self {
        self.max_reclaims = max_reclaims;
        self
    }

    /// Register or re-register a worker. Idempotent.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: &Capabilities,
    ) -> Result<Worker> {
        let worker = self.store.upsert_worker(worker_id, capabilities).await?;
        info!(worker_id, capabilities = ?worker.capabilities, "worker registered");
        Ok(worker)
    }

    /// Refresh a worker's heartbeat. False if it was never registered (or
    /// has been removed).
    pub async fn heartbeat(&self, worker_id: &str) -> Result<bool> {
        let known = self.store.touch_heartbeat(worker_id).await?;
        if !known {
            debug!(worker_id, "heartbeat from unknown worker");
        }
        Ok(known)
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        self.store.get_worker(worker_id).await
    }

    /// Workers heard from within `threshold`.
    pub async fn list_active(&self, threshold: Duration) -> Result<Vec<Worker>> {
        let since = self.store.clock().now() - threshold;
        self.store.list_workers_by_heartbeat(since, true).await
    }

    /// Workers silent for longer than `threshold`.
    pub async fn list_stale(&self, threshold: Duration) -> Result<Vec<Worker>> {
        let since = self.store.clock().now() - threshold;
        self.store.list_workers_by_heartbeat(since, false).await
    }

    /// Return every task whose lease has expired to the queue.
    ///
    /// `attempt_count` is left alone. Tasks that already hit the reclaim cap
    /// are failed terminally instead.
    pub async fn reclaim_expired_leases(&self) -> Result<ReclaimReport> {
        let report = self.store.reclaim_expired(self.max_reclaims).await?;
        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "reclaimed expired leases"
            );
        }
        Ok(report)
    }

    /// Deregister a worker. Its in-flight tasks keep their leases.
    pub async fn remove_worker(&self, worker_id: &str) -> Result<bool> {
        let removed = self.store.delete_worker(worker_id).await?;
        if removed {
            info!(worker_id, "worker removed");
        }
        Ok(removed)
    }

    /// Delete workers silent for longer than `older_than`.
    pub async fn sweep_stale_workers(&self, older_than: Duration) -> Result<u64> {
        let cutoff = self.store.clock().now() - older_than;
        let removed = self.store.delete_workers_seen_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "swept long-stale workers");
        }
        Ok(removed)
    }
}
