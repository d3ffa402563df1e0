//! Claim, execute and resolve tasks.
//!
//! Claiming is two steps: a read-only selection over eligible candidates,
//! then one conditional UPDATE that only succeeds if the task is still
//! queued. Losing that race just means selecting again.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use opentelemetry::KeyValue;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::health::DEFAULT_MAX_RECLAIMS;
use crate::model::{Capabilities, CapabilityValue, Task, TaskId, satisfies};
use crate::retry::RetryPolicy;
use crate::scheduling::{Candidate, SchedulingStrategy};
use crate::store::Store;
use crate::store::tasks::FailOutcome;
use crate::telemetry::metrics;

use super::executor::{EchoExecutor, ExecutionOutcome, Executor};

/// Who is asking for work, and for how long they want it.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub capabilities: Capabilities,
    pub lease: chrono::Duration,
    /// Only offer these task types. `None` means any type.
    pub task_types: Option<Vec<String>>,
}

impl ClaimRequest {
    pub fn new(worker_id: impl Into<String>, lease: chrono::Duration) -> Self {
        Self {
            worker_id: worker_id.into(),
            capabilities: Capabilities::new(),
            lease,
            task_types: None,
        }
    }

    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn capability(mut self, key: impl Into<String>, value: impl Into<CapabilityValue>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    pub fn task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(Error::Validation("worker_id must not be empty".to_string()));
        }
        if self.lease <= chrono::Duration::zero() {
            return Err(Error::Validation("lease must be positive".to_string()));
        }
        Ok(())
    }
}

/// Claims and resolves tasks on behalf of workers. Shareable across worker
/// loops in one process.
pub struct TaskClaimer {
    store: Store,
    strategy: SchedulingStrategy,
    retry: RetryPolicy,
    executor: Arc<dyn Executor>,
    rng: Mutex<StdRng>,
    claim_retries: u32,
    candidate_window: u32,
    reclaim_on_claim: bool,
    max_reclaims: u32,
}

impl std::fmt::Debug for TaskClaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClaimer")
            .field("strategy", &self.strategy.kind())
            .field("retry", &self.retry)
            .field("claim_retries", &self.claim_retries)
            .field("candidate_window", &self.candidate_window)
            .finish_non_exhaustive()
    }
}

impl TaskClaimer {
    pub const DEFAULT_CLAIM_RETRIES: u32 = 5;
    pub const DEFAULT_CANDIDATE_WINDOW: u32 = 256;

    pub fn new(store: Store, strategy: SchedulingStrategy) -> Self {
        Self {
            store,
            strategy,
            retry: RetryPolicy::default(),
            executor: Arc::new(EchoExecutor),
            rng: Mutex::new(StdRng::from_entropy()),
            claim_retries: Self::DEFAULT_CLAIM_RETRIES,
            candidate_window: Self::DEFAULT_CANDIDATE_WINDOW,
            reclaim_on_claim: true,
            max_reclaims: DEFAULT_MAX_RECLAIMS,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Seed selection and jitter for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_claim_retries(mut self, retries: u32) -> Self {
        self.claim_retries = retries.max(1);
        self
    }

    /// Upper bound on candidates loaded per selection page.
    pub fn with_candidate_window(mut self, window: u32) -> Self {
        self.candidate_window = window.max(1);
        self
    }

    /// Reclaim expired leases before selecting, so a dead worker's tasks are
    /// available without waiting for the housekeeper.
    pub fn with_reclaim_on_claim(mut self, enabled: bool, max_reclaims: u32) -> Self {
        self.reclaim_on_claim = enabled;
        self.max_reclaims = max_reclaims;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Claim one eligible task for `request.worker_id`.
    ///
    /// `Ok(None)` when nothing is eligible, or when every selection in
    /// `claim_retries` attempts lost its race to another worker.
    pub async fn claim(&self, request: &ClaimRequest) -> Result<Option<Task>> {
        request.validate()?;
        let started = Instant::now();

        if self.reclaim_on_claim {
            let now = self.store.clock().now();
            if self.store.count_expired_leases(now).await? > 0 {
                self.store.reclaim_expired(self.max_reclaims).await?;
            }
        }

        for attempt in 1..=self.claim_retries {
            let candidates = self.load_candidates(request).await?;
            let picked = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                self.strategy.select_next(&candidates, &mut *rng)
            };
            let Some(id) = picked else {
                record_claim("empty", started);
                return Ok(None);
            };

            if let Some(task) = self
                .store
                .claim_candidate(id, &request.worker_id, request.lease)
                .await?
            {
                record_claim("claimed", started);
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    worker_id = %request.worker_id,
                    priority = task.priority,
                    "task claimed"
                );
                return Ok(Some(task));
            }
            debug!(task_id = %id, attempt, "lost claim race, reselecting");
        }

        record_claim("contended", started);
        warn!(
            worker_id = %request.worker_id,
            attempts = self.claim_retries,
            "gave up claiming after repeated lost races"
        );
        Ok(None)
    }

    /// The first page of candidates containing anything this worker may take.
    async fn load_candidates(&self, request: &ClaimRequest) -> Result<Vec<Candidate>> {
        let now = self.store.clock().now();
        let window = i64::from(self.candidate_window);
        let order = self.strategy.candidate_order();
        let mut offset = 0i64;

        loop {
            let page = self
                .store
                .eligible_candidates(now, request.task_types.as_deref(), order, window, offset)
                .await?;
            let exhausted = (page.len() as i64) < window;
            let eligible: Vec<Candidate> = page
                .into_iter()
                .filter(|c| satisfies(&request.capabilities, &c.requirements))
                .collect();
            if !eligible.is_empty() || exhausted {
                return Ok(eligible);
            }
            offset += window;
        }
    }

    /// Mark a claimed task as started. Owner only.
    pub async fn start(&self, task_id: TaskId, worker_id: &str) -> Result<Task> {
        self.store.mark_processing(task_id, worker_id).await
    }

    /// Run the task's payload through the executor.
    pub async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let started = Instant::now();
        let outcome = self.executor.execute(task).await.timed(started);
        metrics::operation_duration_ms().record(
            outcome.duration_ms as f64,
            &[
                KeyValue::new("operation", "execute"),
                KeyValue::new("task_type", task.task_type.clone()),
            ],
        );
        outcome
    }

    /// Resolve successfully. Owner only; a reclaimed task yields `Ownership`.
    pub async fn complete(
        &self,
        task_id: TaskId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Task> {
        let task = self.store.complete_task(task_id, worker_id, result).await?;
        info!(task_id = %task_id, worker_id, "task completed");
        Ok(task)
    }

    /// Record a failed attempt. Owner only.
    pub async fn fail(&self, task_id: TaskId, worker_id: &str, error: &str) -> Result<FailOutcome> {
        let jitter = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            self.retry.draw_jitter(&mut *rng)
        };
        let outcome = self
            .store
            .fail_task(task_id, worker_id, error, self.retry, jitter)
            .await?;

        match &outcome {
            FailOutcome::Retrying(task) => info!(
                task_id = %task_id,
                attempt = task.attempt_count,
                max_attempts = task.max_attempts,
                not_before = %task.not_before,
                error,
                "task failed, will retry"
            ),
            FailOutcome::Exhausted(task) => warn!(
                task_id = %task_id,
                attempts = task.attempt_count,
                error,
                "task failed permanently"
            ),
        }
        Ok(outcome)
    }

    /// Complete or fail according to `outcome`.
    pub async fn resolve(
        &self,
        task_id: TaskId,
        worker_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<Task> {
        if outcome.success {
            let result = outcome.result.unwrap_or(serde_json::Value::Null);
            self.complete(task_id, worker_id, result).await
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "executor reported failure".to_string());
            Ok(self.fail(task_id, worker_id, &error).await?.into_task())
        }
    }

    /// Withdraw a queued task.
    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        let task = self.store.cancel_task(task_id).await?;
        info!(task_id = %task_id, "task cancelled");
        Ok(task)
    }
}

fn record_claim(result: &'static str, started: Instant) {
    metrics::claims().add(1, &[KeyValue::new("result", result)]);
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", "claim")],
    );
}
