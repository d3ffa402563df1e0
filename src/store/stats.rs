//! Read-only aggregate queries backing queue metrics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::clock::{from_millis, to_millis};
use crate::error::Result;
use crate::model::TaskStatus;

/// Raw counts read in one pass over the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct QueueCounts {
    pub by_status: BTreeMap<TaskStatus, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub oldest_queued: Option<DateTime<Utc>>,
    pub active_workers: u64,
    pub stale_workers: u64,
}

impl super::Store {
    /// Aggregate task and worker counts from one read snapshot.
    ///
    /// `by_type` counts tasks not yet terminal. A worker is active if it
    /// heartbeated at or after `active_since`.
    pub(crate) async fn queue_counts(&self, active_since: DateTime<Utc>) -> Result<QueueCounts> {
        let mut counts = QueueCounts::default();
        let mut tx = self.pool().begin().await?;

        let by_status: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&mut *tx)
                .await?;
        for (status, n) in by_status {
            counts.by_status.insert(status.parse()?, n as u64);
        }

        let by_type: Vec<(String, i64)> = sqlx::query_as(
            "SELECT task_type, COUNT(*) FROM tasks
             WHERE status IN ('queued', 'claimed', 'processing')
             GROUP BY task_type",
        )
        .fetch_all(&mut *tx)
        .await?;
        counts.by_type = by_type.into_iter().map(|(t, n)| (t, n as u64)).collect();

        let (oldest,): (Option<i64>,) =
            sqlx::query_as("SELECT MIN(created_at) FROM tasks WHERE status = 'queued'")
                .fetch_one(&mut *tx)
                .await?;
        counts.oldest_queued = oldest.map(from_millis);

        let (active, stale): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(last_heartbeat >= ?1), 0),
                    COALESCE(SUM(last_heartbeat < ?1), 0)
             FROM workers",
        )
        .bind(to_millis(active_since))
        .fetch_one(&mut *tx)
        .await?;
        counts.active_workers = active as u64;
        counts.stale_workers = stale as u64;

        tx.commit().await?;
        Ok(counts)
    }
}
