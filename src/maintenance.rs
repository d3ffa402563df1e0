//! Backup, retention cleanup and WAL checkpointing.
//!
//! Nothing here runs on its own; the housekeeper (or an operator) calls these
//! on a schedule. All of it is safe to run while workers are active.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::maintenance::CheckpointStats;
use crate::telemetry::metrics;

/// What happens to terminal tasks past retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    #[default]
    Delete,
    /// Copy into `tasks_archive`, then delete.
    Archive,
}

impl std::str::FromStr for RetentionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delete" => Ok(RetentionMode::Delete),
            "archive" => Ok(RetentionMode::Archive),
            other => Err(Error::Validation(format!(
                "unknown retention mode '{other}' (expected delete or archive)"
            ))),
        }
    }
}

/// A completed backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    /// Hex SHA-256 of the backup file.
    pub checksum: String,
    pub path: PathBuf,
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VacuumReport {
    pub removed: u64,
    /// Rows copied to the archive table (0 in delete mode).
    pub archived: u64,
    pub batches: u32,
    pub cutoff: DateTime<Utc>,
}

/// Maintenance operations over one store.
#[derive(Debug, Clone)]
pub struct Maintenance {
    store: Store,
    retention_mode: RetentionMode,
    batch_size: u32,
}

impl Maintenance {
    pub const DEFAULT_BATCH_SIZE: u32 = 500;

    pub fn new(store: Store) -> Self {
        Self {
            store,
            retention_mode: RetentionMode::Delete,
            batch_size: Self::DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_retention_mode(mut self, mode: RetentionMode) -> Self {
        self.retention_mode = mode;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Write a consistent snapshot into `dest_dir` and checksum it.
    ///
    /// Every failure, whatever its cause, is reported as `BackupFailure`.
    pub async fn backup(&self, dest_dir: &Path) -> Result<BackupRecord> {
        let started = Instant::now();
        let result = self.try_backup(dest_dir).await.map_err(|e| match e {
            Error::BackupFailure(_) => e,
            other => Error::BackupFailure(other.to_string()),
        });
        record_run("backup", started, result.is_ok());

        match &result {
            Ok(record) => info!(
                path = %record.path.display(),
                checksum = %record.checksum,
                "backup written"
            ),
            Err(e) => warn!(dest = %dest_dir.display(), "backup failed: {e}"),
        }
        result
    }

    async fn try_backup(&self, dest_dir: &Path) -> Result<BackupRecord> {
        tokio::fs::create_dir_all(dest_dir).await?;

        // Not fatal: VACUUM INTO reads through the WAL anyway.
        if let Err(e) = self.store.checkpoint_wal().await {
            warn!("pre-backup checkpoint failed: {e}");
        }

        let timestamp = self.store.clock().now();
        let path = unused_backup_path(dest_dir, timestamp).await?;
        self.store.vacuum_into(&path).await?;

        let checksum = file_sha256(path.clone()).await?;
        Ok(BackupRecord {
            timestamp,
            checksum,
            path,
        })
    }

    /// Re-hash a backup file and compare against its record.
    pub async fn verify_backup(record: &BackupRecord) -> Result<bool> {
        let actual = file_sha256(record.path.clone()).await?;
        Ok(actual == record.checksum)
    }

    /// Remove terminal tasks whose `completed_at` is older than `older_than`.
    ///
    /// Works in batches, one transaction each, yielding between them so
    /// claims are never locked out for the whole pass.
    pub async fn vacuum_completed(&self, older_than: chrono::Duration) -> Result<VacuumReport> {
        let started = Instant::now();
        let cutoff = self.store.clock().now() - older_than;
        let archive = self.retention_mode == RetentionMode::Archive;

        let mut report = VacuumReport {
            removed: 0,
            archived: 0,
            batches: 0,
            cutoff,
        };

        let result = loop {
            match self
                .store
                .remove_terminal_batch(cutoff, self.batch_size, archive)
                .await
            {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    report.removed += n;
                    report.batches += 1;
                    if archive {
                        report.archived += n;
                    }
                    if n < u64::from(self.batch_size) {
                        break Ok(());
                    }
                    tokio::task::yield_now().await;
                }
                Err(e) => break Err(e),
            }
        };
        record_run("vacuum", started, result.is_ok());
        result?;

        if report.removed > 0 {
            info!(
                removed = report.removed,
                batches = report.batches,
                mode = ?self.retention_mode,
                "retention cleanup"
            );
        }
        Ok(report)
    }

    /// Fold the WAL back into the main file.
    pub async fn checkpoint(&self) -> Result<CheckpointStats> {
        let started = Instant::now();
        let result = self.store.checkpoint_wal().await;
        record_run("checkpoint", started, result.is_ok());
        if let Ok(stats) = &result {
            if stats.busy {
                warn!(
                    log_frames = stats.log_frames,
                    checkpointed = stats.checkpointed_frames,
                    "checkpoint could not complete, readers still active"
                );
            }
        }
        result
    }
}

fn record_run(job: &'static str, started: Instant, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    metrics::maintenance_runs().add(
        1,
        &[KeyValue::new("job", job), KeyValue::new("result", outcome)],
    );
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", job)],
    );
}

async fn unused_backup_path(dest_dir: &Path, at: DateTime<Utc>) -> Result<PathBuf> {
    let stem = format!("taskq-{}", at.format("%Y%m%dT%H%M%S%.3fZ"));
    for n in 0u32..1000 {
        let name = if n == 0 {
            format!("{stem}.db")
        } else {
            format!("{stem}-{n}.db")
        };
        let candidate = dest_dir.join(name);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(Error::BackupFailure(format!(
        "no free backup file name for {stem} in {}",
        dest_dir.display()
    )))
}

async fn file_sha256(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| Error::Other(format!("checksum task failed: {e}")))?
}
