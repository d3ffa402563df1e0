//! The seam between the queue and whatever actually does the work.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Task;

/// Result of running one task's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Stored on the task when `success`.
    pub result: Option<serde_json::Value>,
    /// Recorded as `last_error` when not `success`.
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub(crate) fn timed(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Executes task payloads. The queue never looks inside a payload.
///
/// Implementations report failure through the outcome rather than panicking;
/// a failed outcome counts against the task's attempt limit.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: &Task) -> ExecutionOutcome;
}

/// Succeeds with the task's payload as its result.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        ExecutionOutcome::succeeded(task.payload.clone())
    }
}
