//! Task operations: enqueue, lookup, claim, resolution, cancel, lease reclaim.
//!
//! Ownership transfers are single conditional UPDATEs. The WHERE clause
//! carries the precondition (status, owner), so a zero-row result means the
//! precondition no longer held and nothing was written.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::sqlite::SqliteConnection;
use tracing::debug;

use crate::clock::{from_millis, to_millis};
use crate::error::{Error, Result};
use crate::model::*;
use crate::retry::{AttemptLimits, RetryPolicy};
use crate::scheduling::Candidate;
use crate::telemetry::metrics;

pub(crate) const TASK_COLUMNS: &str = "id, task_type, status, payload, requirements, priority, \
     created_at, updated_at, claimed_by, claimed_at, lease_expires_at, not_before, \
     attempt_count, max_attempts, reclaim_count, last_error, result, completed_at";

/// What `fail` did with the task.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Attempts remain: back in the queue, claimable from `task.not_before`.
    Retrying(Task),
    /// Attempts exhausted: terminally failed with `last_error` kept.
    Exhausted(Task),
}

impl FailOutcome {
    pub fn task(&self) -> &Task {
        match self {
            FailOutcome::Retrying(task) | FailOutcome::Exhausted(task) => task,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            FailOutcome::Retrying(task) | FailOutcome::Exhausted(task) => task,
        }
    }
}

/// Result of one lease reclamation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Returned to the queue with `attempt_count` untouched.
    pub requeued: Vec<TaskId>,
    /// Hit the reclaim cap and were failed terminally.
    pub failed: Vec<TaskId>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Filter for [`Store::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<i64>,
}

impl super::Store {
    /// Enqueue a new task in `queued`.
    ///
    /// `max_attempts` comes from the builder if set, else from `limits`.
    pub async fn enqueue(&self, new: NewTask, limits: &AttemptLimits) -> Result<Task> {
        new.validate()?;

        let now = self.now();
        let task = Task {
            id: TaskId::new(),
            max_attempts: limits.resolve(&new.task_type, new.max_attempts),
            task_type: new.task_type,
            status: TaskStatus::Queued,
            payload: new.payload,
            requirements: new.requirements,
            priority: new.priority,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            not_before: now + new.delay.unwrap_or_else(chrono::Duration::zero),
            attempt_count: 0,
            reclaim_count: 0,
            last_error: None,
            result: None,
            completed_at: None,
        };

        let row = task.clone();
        self.with_transaction(move |conn| {
            let row = row.clone();
            Box::pin(async move { insert_task_on(conn, &row).await })
        })
        .await?;

        metrics::tasks_enqueued().add(1, &[KeyValue::new("task_type", task.task_type.clone())]);
        Ok(task)
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let mut conn = self.pool().acquire().await?;
        get_task_on(&mut conn, id).await
    }

    /// List tasks, newest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.task_type.as_deref())
            .bind(filter.limit.unwrap_or(-1))
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Cancel a queued task. Any other status is an invalid transition.
    pub async fn cancel_task(&self, id: TaskId) -> Result<Task> {
        let now = to_millis(self.now());
        let task = self
            .with_transaction(move |conn| {
                Box::pin(async move {
                    let current = get_task_on(conn, id).await?;
                    check_transition(current.status, TaskStatus::Cancelled)?;

                    let sql = format!(
                        "UPDATE tasks SET status = 'cancelled', completed_at = ?1, updated_at = ?1
                         WHERE id = ?2 AND status = 'queued'
                         RETURNING {TASK_COLUMNS}"
                    );
                    let row: TaskRow = sqlx::query_as(&sql)
                        .bind(now)
                        .bind(id.to_string())
                        .fetch_one(&mut *conn)
                        .await?;
                    row.into_task()
                })
            })
            .await?;

        record_transition(TaskStatus::Queued, TaskStatus::Cancelled);
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Selection and claim
    // -----------------------------------------------------------------------

    /// Queued tasks claimable at `now`, in `order`, one page at a time.
    ///
    /// Read-only. Capability filtering happens in the caller.
    pub(crate) async fn eligible_candidates(
        &self,
        now: DateTime<Utc>,
        task_types: Option<&[String]>,
        order: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Candidate>> {
        let types = task_types.map(serde_json::to_string).transpose()?;
        let sql = format!(
            "SELECT id, priority, created_at, rowid AS seq, requirements FROM tasks
             WHERE status = 'queued' AND not_before <= ?1
               AND (?2 IS NULL OR task_type IN (SELECT value FROM json_each(?2)))
             ORDER BY {order}
             LIMIT ?3 OFFSET ?4"
        );
        let rows: Vec<CandidateRow> = sqlx::query_as(&sql)
            .bind(to_millis(now))
            .bind(types)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await?;

        rows.into_iter().map(CandidateRow::into_candidate).collect()
    }

    /// The one conditional UPDATE that transfers ownership.
    ///
    /// Returns `None` if the task was no longer queued and claimable, i.e.
    /// another worker won the race.
    pub(crate) async fn claim_candidate(
        &self,
        id: TaskId,
        worker_id: &str,
        lease: chrono::Duration,
    ) -> Result<Option<Task>> {
        let now = self.now();
        let now_ms = to_millis(now);
        let expires_ms = to_millis(now + lease);
        let worker_id = worker_id.to_string();

        let row: Option<TaskRow> = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                Box::pin(async move {
                    let sql = format!(
                        "UPDATE tasks
                         SET status = 'claimed', claimed_by = ?1, claimed_at = ?2,
                             lease_expires_at = ?3, updated_at = ?2
                         WHERE id = ?4 AND status = 'queued' AND not_before <= ?2
                         RETURNING {TASK_COLUMNS}"
                    );
                    Ok(sqlx::query_as(&sql)
                        .bind(worker_id)
                        .bind(now_ms)
                        .bind(expires_ms)
                        .bind(id.to_string())
                        .fetch_optional(&mut *conn)
                        .await?)
                })
            })
            .await?;

        let task = row.map(TaskRow::into_task).transpose()?;
        if task.is_some() {
            record_transition(TaskStatus::Queued, TaskStatus::Claimed);
        }
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Claimed → Processing. Idempotent for the owner.
    pub async fn mark_processing(&self, id: TaskId, worker_id: &str) -> Result<Task> {
        let now = to_millis(self.now());
        let worker_id = worker_id.to_string();

        let (task, changed) = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                Box::pin(async move {
                    let current = get_task_on(conn, id).await?;
                    if !owned_by(&current, &worker_id) {
                        return Err(ownership_error(current, &worker_id));
                    }
                    if current.status == TaskStatus::Processing {
                        return Ok((current, false));
                    }
                    check_transition(current.status, TaskStatus::Processing)?;

                    let sql = format!(
                        "UPDATE tasks SET status = 'processing', updated_at = ?1
                         WHERE id = ?2 AND claimed_by = ?3 AND status = 'claimed'
                         RETURNING {TASK_COLUMNS}"
                    );
                    let row: TaskRow = sqlx::query_as(&sql)
                        .bind(now)
                        .bind(id.to_string())
                        .bind(&worker_id)
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok((row.into_task()?, true))
                })
            })
            .await?;

        if changed {
            record_transition(TaskStatus::Claimed, TaskStatus::Processing);
        }
        Ok(task)
    }

    /// Claimed/Processing → Completed, owner only.
    pub async fn complete_task(
        &self,
        id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Task> {
        let clock_now = self.now();
        let now = to_millis(clock_now);
        let worker_id = worker_id.to_string();
        let result = serde_json::to_string(&result)?;

        let (task, from) = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                let result = result.clone();
                Box::pin(async move {
                    let current = get_task_on(conn, id).await?;
                    if !owned_by(&current, &worker_id) {
                        return Err(ownership_error(current, &worker_id));
                    }
                    check_transition(current.status, TaskStatus::Completed)?;
                    log_late_resolution(&current, clock_now);

                    let sql = format!(
                        "UPDATE tasks
                         SET status = 'completed', result = ?1, completed_at = ?2, updated_at = ?2,
                             claimed_by = NULL, lease_expires_at = NULL
                         WHERE id = ?3 AND claimed_by = ?4 AND status IN ('claimed', 'processing')
                         RETURNING {TASK_COLUMNS}"
                    );
                    let row: TaskRow = sqlx::query_as(&sql)
                        .bind(result)
                        .bind(now)
                        .bind(id.to_string())
                        .bind(&worker_id)
                        .fetch_one(&mut *conn)
                        .await?;

                    bump_processed_on(conn, &worker_id).await?;
                    Ok((row.into_task()?, current.status))
                })
            })
            .await?;

        record_transition(from, TaskStatus::Completed);
        Ok(task)
    }

    /// Record a failed attempt, owner only.
    ///
    /// Increments `attempt_count`. With attempts left the task is re-queued
    /// with `not_before = now + backoff`; otherwise it is failed terminally.
    /// `jitter` is a multiplier drawn from `policy` by the caller.
    pub async fn fail_task(
        &self,
        id: TaskId,
        worker_id: &str,
        error: &str,
        policy: RetryPolicy,
        jitter: f64,
    ) -> Result<FailOutcome> {
        let clock_now = self.now();
        let now = to_millis(clock_now);
        let worker_id = worker_id.to_string();
        let error = error.to_string();

        let (outcome, from) = self
            .with_transaction(move |conn| {
                let worker_id = worker_id.clone();
                let error = error.clone();
                Box::pin(async move {
                    let current = get_task_on(conn, id).await?;
                    if !owned_by(&current, &worker_id) {
                        return Err(ownership_error(current, &worker_id));
                    }

                    let retry = current.attempts_remaining() > 1;
                    let target = if retry {
                        TaskStatus::Queued
                    } else {
                        TaskStatus::Failed
                    };
                    check_transition(current.status, target)?;
                    log_late_resolution(&current, clock_now);

                    let attempts = current.attempt_count + 1;
                    let outcome = if retry {
                        let delay = policy.jittered(attempts, jitter);
                        let not_before = now + delay.as_millis() as i64;
                        let sql = format!(
                            "UPDATE tasks
                             SET status = 'queued', attempt_count = ?1, last_error = ?2,
                                 not_before = ?3, updated_at = ?4,
                                 claimed_by = NULL, lease_expires_at = NULL
                             WHERE id = ?5
                             RETURNING {TASK_COLUMNS}"
                        );
                        let row: TaskRow = sqlx::query_as(&sql)
                            .bind(attempts as i64)
                            .bind(&error)
                            .bind(not_before)
                            .bind(now)
                            .bind(id.to_string())
                            .fetch_one(&mut *conn)
                            .await?;
                        FailOutcome::Retrying(row.into_task()?)
                    } else {
                        let sql = format!(
                            "UPDATE tasks
                             SET status = 'failed', attempt_count = ?1, last_error = ?2,
                                 completed_at = ?3, updated_at = ?3,
                                 claimed_by = NULL, lease_expires_at = NULL
                             WHERE id = ?4
                             RETURNING {TASK_COLUMNS}"
                        );
                        let row: TaskRow = sqlx::query_as(&sql)
                            .bind(attempts.min(current.max_attempts) as i64)
                            .bind(&error)
                            .bind(now)
                            .bind(id.to_string())
                            .fetch_one(&mut *conn)
                            .await?;
                        FailOutcome::Exhausted(row.into_task()?)
                    };

                    bump_processed_on(conn, &worker_id).await?;
                    Ok((outcome, current.status))
                })
            })
            .await?;

        record_transition(from, outcome.task().status);
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Number of owned tasks whose lease ran out before `now`.
    pub(crate) async fn count_expired_leases(&self, now: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks
             WHERE status IN ('claimed', 'processing') AND lease_expires_at < ?1",
        )
        .bind(to_millis(now))
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Return expired-lease tasks to the queue in one transaction.
    ///
    /// `attempt_count` is never touched. A task already reclaimed
    /// `max_reclaims` times is failed instead of re-queued.
    pub async fn reclaim_expired(&self, max_reclaims: u32) -> Result<ReclaimReport> {
        let now = to_millis(self.now());
        let max_reclaims = max_reclaims as i64;

        let (failed, requeued) = self
            .with_transaction(move |conn| {
                Box::pin(async move {
                    let failed: Vec<(String,)> = sqlx::query_as(
                        "UPDATE tasks
                         SET status = 'failed', claimed_by = NULL, lease_expires_at = NULL,
                             completed_at = ?1, updated_at = ?1,
                             last_error = 'lease expired ' || (reclaim_count + 1)
                                          || ' times without resolution'
                         WHERE status IN ('claimed', 'processing')
                           AND lease_expires_at < ?1 AND reclaim_count >= ?2
                         RETURNING id",
                    )
                    .bind(now)
                    .bind(max_reclaims)
                    .fetch_all(&mut *conn)
                    .await?;

                    let requeued: Vec<(String,)> = sqlx::query_as(
                        "UPDATE tasks
                         SET status = 'queued', claimed_by = NULL, lease_expires_at = NULL,
                             reclaim_count = reclaim_count + 1, updated_at = ?1
                         WHERE status IN ('claimed', 'processing') AND lease_expires_at < ?1
                         RETURNING id",
                    )
                    .bind(now)
                    .fetch_all(&mut *conn)
                    .await?;

                    Ok((failed, requeued))
                })
            })
            .await?;

        let report = ReclaimReport {
            requeued: parse_ids(requeued)?,
            failed: parse_ids(failed)?,
        };

        if !report.requeued.is_empty() {
            metrics::leases_reclaimed().add(
                report.requeued.len() as u64,
                &[KeyValue::new("outcome", "requeued")],
            );
        }
        if !report.failed.is_empty() {
            metrics::leases_reclaimed().add(
                report.failed.len() as u64,
                &[KeyValue::new("outcome", "failed")],
            );
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Inner functions. These accept &mut SqliteConnection so they run inside any
// transaction body.
// ---------------------------------------------------------------------------

async fn insert_task_on(conn: &mut SqliteConnection, task: &Task) -> Result<()> {
    sqlx::query(
        "INSERT INTO tasks (
            id, task_type, status, payload, requirements, priority, created_at, updated_at,
            not_before, attempt_count, max_attempts, reclaim_count
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )
    .bind(task.id.to_string())
    .bind(&task.task_type)
    .bind(task.status.as_str())
    .bind(serde_json::to_string(&task.payload)?)
    .bind(serde_json::to_string(&task.requirements)?)
    .bind(task.priority)
    .bind(to_millis(task.created_at))
    .bind(to_millis(task.updated_at))
    .bind(to_millis(task.not_before))
    .bind(task.attempt_count as i64)
    .bind(task.max_attempts as i64)
    .bind(task.reclaim_count as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn get_task_on(conn: &mut SqliteConnection, id: TaskId) -> Result<Task> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    let row: Option<TaskRow> = sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
        .into_task()
}

async fn bump_processed_on(conn: &mut SqliteConnection, worker_id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE workers SET tasks_processed_count = tasks_processed_count + 1
         WHERE worker_id = ?1",
    )
    .bind(worker_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn owned_by(task: &Task, worker_id: &str) -> bool {
    task.status.is_owned() && task.claimed_by.as_deref() == Some(worker_id)
}

fn ownership_error(task: Task, worker_id: &str) -> Error {
    Error::Ownership {
        task_id: task.id.to_string(),
        worker_id: worker_id.to_string(),
        owner: task.claimed_by,
    }
}

/// Reject `from -> to` unless the lifecycle allows it.
fn check_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// The owner may still resolve after its lease ran out, as long as no sweep
/// or claimer has reclaimed the task yet.
fn log_late_resolution(task: &Task, now: DateTime<Utc>) {
    if task.lease_expired(now) {
        debug!(task_id = %task.id, owner = ?task.claimed_by, "resolving after lease expiry");
    }
}

fn record_transition(from: TaskStatus, to: TaskStatus) {
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

fn parse_ids(rows: Vec<(String,)>) -> Result<Vec<TaskId>> {
    rows.into_iter().map(|(id,)| id.parse()).collect()
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
pub(crate) struct TaskRow {
    id: String,
    task_type: String,
    status: String,
    payload: String,
    requirements: String,
    priority: i32,
    created_at: i64,
    updated_at: i64,
    claimed_by: Option<String>,
    claimed_at: Option<i64>,
    lease_expires_at: Option<i64>,
    not_before: i64,
    attempt_count: i64,
    max_attempts: i64,
    reclaim_count: i64,
    last_error: Option<String>,
    result: Option<String>,
    completed_at: Option<i64>,
}

impl TaskRow {
    pub(crate) fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id.parse()?,
            task_type: self.task_type,
            status: self.status.parse()?,
            payload: serde_json::from_str(&self.payload)?,
            requirements: serde_json::from_str(&self.requirements)?,
            priority: self.priority,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            claimed_by: self.claimed_by,
            claimed_at: self.claimed_at.map(from_millis),
            lease_expires_at: self.lease_expires_at.map(from_millis),
            not_before: from_millis(self.not_before),
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            reclaim_count: self.reclaim_count as u32,
            last_error: self.last_error,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            completed_at: self.completed_at.map(from_millis),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: String,
    priority: i32,
    created_at: i64,
    seq: i64,
    requirements: String,
}

impl CandidateRow {
    fn into_candidate(self) -> Result<Candidate> {
        Ok(Candidate {
            id: self.id.parse()?,
            priority: self.priority,
            created_at: from_millis(self.created_at),
            seq: self.seq,
            requirements: serde_json::from_str(&self.requirements)?,
        })
    }
}
