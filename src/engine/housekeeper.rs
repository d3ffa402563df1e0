//! Periodic maintenance loop.
//!
//! Runs lease reclamation, the stale-worker sweep, retention cleanup and a
//! WAL checkpoint every cycle, plus a backup on its own longer interval.
//! A failing step is logged and tried again next cycle; it never stops the
//! others.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::config::Config;
use crate::health::HealthMonitor;
use crate::maintenance::{BackupRecord, Maintenance, VacuumReport};
use crate::store::maintenance::CheckpointStats;
use crate::store::tasks::ReclaimReport;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    pub interval: Duration,
    pub retention: chrono::Duration,
    pub worker_sweep_after: chrono::Duration,
    pub backup_dir: Option<PathBuf>,
    pub backup_interval: chrono::Duration,
}

impl HousekeeperConfig {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.maintenance;
        Self {
            interval: Duration::from_secs(m.interval_seconds),
            retention: chrono::Duration::seconds(m.retention_seconds as i64),
            worker_sweep_after: chrono::Duration::seconds(m.worker_sweep_after_seconds as i64),
            backup_dir: m.backup_dir.clone(),
            backup_interval: chrono::Duration::seconds(m.backup_interval_seconds as i64),
        }
    }
}

/// What one cycle managed to do. A `None` step failed (and was logged) or
/// was not due.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub reclaimed: Option<ReclaimReport>,
    pub workers_swept: Option<u64>,
    pub vacuum: Option<VacuumReport>,
    pub checkpoint: Option<CheckpointStats>,
    pub backup: Option<BackupRecord>,
}

pub struct Housekeeper {
    health: HealthMonitor,
    maintenance: Maintenance,
    config: HousekeeperConfig,
    last_backup: Mutex<Option<DateTime<Utc>>>,
    shutdown: Arc<Notify>,
    stopping: AtomicBool,
}

impl Housekeeper {
    pub fn new(health: HealthMonitor, maintenance: Maintenance, config: HousekeeperConfig) -> Self {
        Self {
            health,
            maintenance,
            config,
            last_backup: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Run cycles every `interval` until shut down.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "housekeeper started"
        );
        while !self.stopping.load(Ordering::SeqCst) {
            self.run_cycle().await;
            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("housekeeper stopped");
    }

    /// One pass over every job.
    pub async fn run_cycle(&self) -> CycleReport {
        let reclaimed = counted("reclaim", self.health.reclaim_expired_leases().await);
        let workers_swept = counted(
            "sweep",
            self.health
                .sweep_stale_workers(self.config.worker_sweep_after)
                .await,
        );
        let vacuum = logged(
            "vacuum",
            self.maintenance
                .vacuum_completed(self.config.retention)
                .await,
        );
        let checkpoint = logged("checkpoint", self.maintenance.checkpoint().await);
        let backup = self.backup_if_due().await;

        CycleReport {
            reclaimed,
            workers_swept,
            vacuum,
            checkpoint,
            backup,
        }
    }

    async fn backup_if_due(&self) -> Option<BackupRecord> {
        let dir = self.config.backup_dir.as_ref()?;
        let now = self.maintenance.store().clock().now();
        let due = self
            .last_backup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none_or(|last| now - last >= self.config.backup_interval);
        if !due {
            return None;
        }

        // Maintenance::backup logs and counts its own failures.
        let record = self.maintenance.backup(dir).await.ok()?;
        *self.last_backup.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        Some(record)
    }
}

fn logged<T>(job: &'static str, result: crate::error::Result<T>) -> Option<T> {
    result
        .map_err(|e| error!(job, "housekeeping step failed: {e}"))
        .ok()
}

/// Like [`logged`], also counting the run. Maintenance jobs count themselves.
fn counted<T>(job: &'static str, result: crate::error::Result<T>) -> Option<T> {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::maintenance_runs().add(
        1,
        &[KeyValue::new("job", job), KeyValue::new("result", outcome)],
    );
    logged(job, result)
}
