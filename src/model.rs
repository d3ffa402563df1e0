//! Core data model.
//!
//! A task is a unit of work with a type, an opaque payload, a priority, and a
//! lifecycle status. Ownership is a lease held by exactly one worker while the
//! task is claimed or processing.

pub mod capability;
pub mod worker;

pub use capability::{Capabilities, CapabilityValue, satisfies};
pub use worker::{Worker, WorkerStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,

    /// What kind of work this is (e.g. "echo", "resize-image").
    pub task_type: String,

    pub status: TaskStatus,

    /// Arbitrary parameters for the executor. The queue never interprets these.
    pub payload: serde_json::Value,

    /// Capabilities a worker must declare to be offered this task.
    pub requirements: Capabilities,

    /// Lower = more urgent.
    pub priority: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Current owner. Set iff status is claimed or processing.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Earliest time the task may be claimed again after a failure.
    pub not_before: DateTime<Utc>,

    /// Explicit failures recorded so far.
    pub attempt_count: u32,
    pub max_attempts: u32,

    /// Lease expiries that returned the task to the queue.
    pub reclaim_count: u32,

    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// True if the lease has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|expiry| now > expiry)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| Error::Validation(format!("invalid task id '{s}': {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,
    /// Leased to a worker, execution not yet started.
    Claimed,
    /// Worker is executing the payload.
    Processing,
    /// Done successfully. Terminal.
    Completed,
    /// Attempts exhausted. Terminal.
    Failed,
    /// Withdrawn by a producer before any claim. Terminal.
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Claimed,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Can transition from self to `to`? Re-queueing covers both retry and
    /// lease reclaim.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Claimed)
                | (Queued, Cancelled)
                | (Claimed, Processing)
                | (Claimed, Completed)
                | (Claimed, Queued)
                | (Claimed, Failed)
                | (Processing, Completed)
                | (Processing, Queued)
                | (Processing, Failed)
        )
    }

    /// Statuses in which a worker holds the lease.
    pub fn is_owned(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "claimed" => Ok(TaskStatus::Claimed),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(Error::Validation(format!("unknown task status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueuing new tasks. The producer-side API.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) task_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) requirements: Capabilities,
    pub(crate) priority: i32,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) delay: Option<chrono::Duration>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: serde_json::Value::Null,
            requirements: Capabilities::new(),
            priority: 0,
            max_attempts: None,
            delay: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the per-type attempt limit for this task.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    /// Only workers declaring `key = value` may claim this task.
    pub fn require(mut self, key: impl Into<String>, value: impl Into<CapabilityValue>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn requirements(mut self, requirements: Capabilities) -> Self {
        self.requirements = requirements;
        self
    }

    /// Hold the task back from claims for `delay` after enqueue.
    pub fn delay(mut self, delay: chrono::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.task_type.trim().is_empty() {
            return Err(Error::Validation("task type must not be empty".to_string()));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::Validation("max_attempts must be at least 1".to_string()));
        }
        if self.delay.is_some_and(|d| d < chrono::Duration::zero()) {
            return Err(Error::Validation("delay must not be negative".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("dead".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_queued_tasks_can_be_claimed_or_cancelled() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Claimed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Claimed.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Claimed));
    }

    #[test]
    fn lease_and_attempt_helpers() {
        let now = Utc::now();
        let mut task = Task {
            id: TaskId::new(),
            task_type: "echo".to_string(),
            status: TaskStatus::Claimed,
            payload: serde_json::Value::Null,
            requirements: Capabilities::new(),
            priority: 0,
            created_at: now,
            updated_at: now,
            claimed_by: Some("w1".to_string()),
            claimed_at: Some(now),
            lease_expires_at: Some(now + chrono::Duration::seconds(30)),
            not_before: now,
            attempt_count: 2,
            max_attempts: 3,
            reclaim_count: 0,
            last_error: None,
            result: None,
            completed_at: None,
        };

        assert!(!task.lease_expired(now + chrono::Duration::seconds(30)));
        assert!(task.lease_expired(now + chrono::Duration::seconds(31)));
        assert_eq!(task.attempts_remaining(), 1);

        task.attempt_count = 5;
        assert_eq!(task.attempts_remaining(), 0);
        task.lease_expires_at = None;
        assert!(!task.lease_expired(now + chrono::Duration::days(1)));
    }

    #[test]
    fn new_task_rejects_zero_attempts() {
        let err = NewTask::new("echo").max_attempts(0).validate().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(NewTask::new("  ").validate().is_err());
        assert!(NewTask::new("echo").validate().is_ok());
    }
}
