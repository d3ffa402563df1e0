//! Worker registry entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Capabilities;

/// A registered worker identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub worker_id: String,
    pub capabilities: Capabilities,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks this worker has resolved (completed or failed).
    pub tasks_processed_count: u64,
}

impl Worker {
    /// Liveness at `now`. Never stored; always derived from heartbeat age.
    pub fn status(&self, now: DateTime<Utc>, stale_after: Duration) -> WorkerStatus {
        if now - self.last_heartbeat > stale_after {
            WorkerStatus::Stale
        } else {
            WorkerStatus::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Stale,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => f.pad("active"),
            WorkerStatus::Stale => f.pad("stale"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_derived_from_heartbeat_age() {
        let now = Utc::now();
        let worker = Worker {
            worker_id: "w1".into(),
            capabilities: Capabilities::new(),
            registered_at: now,
            last_heartbeat: now - Duration::seconds(10),
            tasks_processed_count: 0,
        };
        assert_eq!(
            worker.status(now, Duration::seconds(30)),
            WorkerStatus::Active
        );
        assert_eq!(
            worker.status(now, Duration::seconds(5)),
            WorkerStatus::Stale
        );
    }
}
