//! Worker registry rows: upsert on registration, heartbeat touch, removal.

use chrono::{DateTime, Utc};

use crate::clock::{from_millis, to_millis};
use crate::error::{Error, Result};
use crate::model::{Capabilities, Worker};

impl super::Store {
    /// Insert or update a worker. Re-registration replaces capabilities and
    /// refreshes the heartbeat; `registered_at` and the processed count are kept.
    pub async fn upsert_worker(
        &self,
        worker_id: &str,
        capabilities: &Capabilities,
    ) -> Result<Worker> {
        if worker_id.trim().is_empty() {
            return Err(Error::Validation("worker_id must not be empty".to_string()));
        }

        let now = to_millis(self.now());
        let worker_id = worker_id.to_string();
        let capabilities = serde_json::to_string(capabilities)?;

        let row: WorkerRow = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                let capabilities = capabilities.clone();
                Box::pin(async move {
                    Ok(sqlx::query_as(
                        "INSERT INTO workers
                            (worker_id, capabilities, registered_at, last_heartbeat)
                         VALUES (?1, ?2, ?3, ?3)
                         ON CONFLICT (worker_id) DO UPDATE
                            SET capabilities = excluded.capabilities,
                                last_heartbeat = excluded.last_heartbeat
                         RETURNING worker_id, capabilities, registered_at, last_heartbeat,
                                   tasks_processed_count",
                    )
                    .bind(worker_id)
                    .bind(capabilities)
                    .bind(now)
                    .fetch_one(&mut *conn)
                    .await?)
                })
            })
            .await?;

        row.into_worker()
    }

    /// Refresh `last_heartbeat`. Returns false if the worker is unknown.
    pub async fn touch_heartbeat(&self, worker_id: &str) -> Result<bool> {
        let now = to_millis(self.now());
        let worker_id = worker_id.to_string();

        let rows = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                Box::pin(async move {
                    Ok(sqlx::query("UPDATE workers SET last_heartbeat = ?1 WHERE worker_id = ?2")
                        .bind(now)
                        .bind(worker_id)
                        .execute(&mut *conn)
                        .await?
                        .rows_affected())
                })
            })
            .await?;

        Ok(rows > 0)
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        let row: Option<WorkerRow> = sqlx::query_as(
            "SELECT worker_id, capabilities, registered_at, last_heartbeat, tasks_processed_count
             FROM workers WHERE worker_id = ?1",
        )
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("worker {worker_id}")))?
            .into_worker()
    }

    /// All workers, most recently seen first.
    pub async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows: Vec<WorkerRow> = sqlx::query_as(
            "SELECT worker_id, capabilities, registered_at, last_heartbeat, tasks_processed_count
             FROM workers ORDER BY last_heartbeat DESC, worker_id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(WorkerRow::into_worker).collect()
    }

    /// Workers whose last heartbeat is at or after `since` (active) or
    /// strictly before it (stale).
    pub(crate) async fn list_workers_by_heartbeat(
        &self,
        since: DateTime<Utc>,
        active: bool,
    ) -> Result<Vec<Worker>> {
        let sql = if active {
            "SELECT worker_id, capabilities, registered_at, last_heartbeat, tasks_processed_count
             FROM workers WHERE last_heartbeat >= ?1 ORDER BY worker_id"
        } else {
            "SELECT worker_id, capabilities, registered_at, last_heartbeat, tasks_processed_count
             FROM workers WHERE last_heartbeat < ?1 ORDER BY worker_id"
        };
        let rows: Vec<WorkerRow> = sqlx::query_as(sql)
            .bind(to_millis(since))
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(WorkerRow::into_worker).collect()
    }

    /// Delete a worker row. In-flight tasks are left to their leases.
    pub async fn delete_worker(&self, worker_id: &str) -> Result<bool> {
        let worker_id = worker_id.to_string();
        let rows = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                Box::pin(async move {
                    Ok(sqlx::query("DELETE FROM workers WHERE worker_id = ?1")
                        .bind(worker_id)
                        .execute(&mut *conn)
                        .await?
                        .rows_affected())
                })
            })
            .await?;
        Ok(rows > 0)
    }

    /// Delete every worker last seen before `cutoff`.
    pub(crate) async fn delete_workers_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = to_millis(cutoff);
        self.with_transaction(move |conn| {
            Box::pin(async move {
                Ok(sqlx::query("DELETE FROM workers WHERE last_heartbeat < ?1")
                    .bind(cutoff)
                    .execute(&mut *conn)
                    .await?
                    .rows_affected())
            })
        })
        .await
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    worker_id: String,
    capabilities: String,
    registered_at: i64,
    last_heartbeat: i64,
    tasks_processed_count: i64,
}

impl WorkerRow {
    fn into_worker(self) -> Result<Worker> {
        Ok(Worker {
            worker_id: self.worker_id,
            capabilities: serde_json::from_str(&self.capabilities)?,
            registered_at: from_millis(self.registered_at),
            last_heartbeat: from_millis(self.last_heartbeat),
            tasks_processed_count: self.tasks_processed_count as u64,
        })
    }
}
