//! Point-in-time queue metrics for operators and dashboards.

use std::collections::BTreeMap;

use chrono::Duration;
use serde::Serialize;

use crate::error::Result;
use crate::model::TaskStatus;
use crate::store::Store;

/// Snapshot of queue health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    /// Every status is present, zero if no task has it.
    pub depth_by_status: BTreeMap<TaskStatus, u64>,
    /// Tasks not yet terminal, per type.
    pub depth_by_type: BTreeMap<String, u64>,
    /// Age of the oldest queued task; `None` when nothing is queued.
    pub oldest_queued_age_seconds: Option<f64>,
    /// `completed / (completed + failed)`; 0 when neither has happened.
    pub success_rate: f64,
    /// `failed / (completed + failed)`; 0 when neither has happened.
    pub failure_rate: f64,
    pub active_workers: u64,
    pub stale_workers: u64,
}

impl QueueMetrics {
    pub fn depth(&self, status: TaskStatus) -> u64 {
        self.depth_by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Compute queue metrics. Read-only; workers with a heartbeat older than
/// `stale_threshold` count as stale.
pub async fn get_queue_metrics(store: &Store, stale_threshold: Duration) -> Result<QueueMetrics> {
    let now = store.clock().now();
    let counts = store.queue_counts(now - stale_threshold).await?;

    let mut depth_by_status: BTreeMap<TaskStatus, u64> =
        TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
    depth_by_status.extend(counts.by_status);

    let completed = depth_by_status[&TaskStatus::Completed];
    let failed = depth_by_status[&TaskStatus::Failed];
    let (success_rate, failure_rate) = rates(completed, failed);

    let oldest_queued_age_seconds = counts
        .oldest_queued
        .map(|created| ((now - created).num_milliseconds().max(0) as f64) / 1000.0);

    Ok(QueueMetrics {
        depth_by_status,
        depth_by_type: counts.by_type,
        oldest_queued_age_seconds,
        success_rate,
        failure_rate,
        active_workers: counts.active_workers,
        stale_workers: counts.stale_workers,
    })
}

fn rates(completed: u64, failed: u64) -> (f64, f64) {
    let total = completed + failed;
    if total == 0 {
        return (0.0, 0.0);
    }
    let total = total as f64;
    (completed as f64 / total, failed as f64 / total)
}
