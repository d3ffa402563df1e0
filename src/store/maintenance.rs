//! Low-level maintenance statements: WAL checkpoint, snapshot, batched
//! removal of terminal rows.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::clock::to_millis;
use crate::error::{Error, Result};

/// Result of `PRAGMA wal_checkpoint(TRUNCATE)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// True if a reader or writer prevented a full checkpoint.
    pub busy: bool,
    /// Frames in the WAL before the checkpoint.
    pub log_frames: i64,
    /// Frames moved into the main database file.
    pub checkpointed_frames: i64,
}

impl super::Store {
    /// Move WAL content into the main file and truncate the WAL.
    pub async fn checkpoint_wal(&self) -> Result<CheckpointStats> {
        let (busy, log, checkpointed): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_one(self.pool())
                .await?;
        Ok(CheckpointStats {
            busy: busy != 0,
            log_frames: log,
            checkpointed_frames: checkpointed,
        })
    }

    /// Write a consistent snapshot of the live store to `dest`.
    ///
    /// `dest` must not exist. Runs concurrently with writers.
    pub(crate) async fn vacuum_into(&self, dest: &Path) -> Result<()> {
        let dest = dest
            .to_str()
            .ok_or_else(|| Error::Validation(format!("non UTF-8 path {}", dest.display())))?;
        sqlx::query("VACUUM INTO ?1")
            .bind(dest)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove up to `batch` terminal tasks completed before `cutoff`, oldest
    /// first, in one transaction. With `archive`, rows are copied into
    /// `tasks_archive` first. Returns the number removed.
    pub(crate) async fn remove_terminal_batch(
        &self,
        cutoff: DateTime<Utc>,
        batch: u32,
        archive: bool,
    ) -> Result<u64> {
        let cutoff = to_millis(cutoff);
        let now = to_millis(self.now());
        let batch = i64::from(batch.max(1));

        self.with_transaction(move |conn| {
            Box::pin(async move {
                let selection = "SELECT id FROM tasks
                     WHERE status IN ('completed', 'failed', 'cancelled')
                       AND completed_at IS NOT NULL AND completed_at < ?1
                     ORDER BY completed_at ASC
                     LIMIT ?2";

                if archive {
                    let sql = format!(
                        "INSERT OR REPLACE INTO tasks_archive
                         SELECT {cols}, ?3 FROM tasks WHERE id IN ({selection})",
                        cols = super::tasks::TASK_COLUMNS,
                    );
                    sqlx::query(&sql)
                        .bind(cutoff)
                        .bind(batch)
                        .bind(now)
                        .execute(&mut *conn)
                        .await?;
                }

                let sql = format!("DELETE FROM tasks WHERE id IN ({selection})");
                let removed = sqlx::query(&sql)
                    .bind(cutoff)
                    .bind(batch)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected();
                Ok(removed)
            })
        })
        .await
    }

    /// Rows currently held in `tasks_archive`.
    pub async fn archived_count(&self) -> Result<u64> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks_archive")
            .fetch_one(self.pool())
            .await?;
        Ok(n as u64)
    }
}
