//! Worker loop: register, heartbeat, claim, execute, resolve, repeat.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::model::{Capabilities, Task, TaskId, TaskStatus};
use crate::telemetry::task::{record_state_transition, start_task_span};

use super::claimer::{ClaimRequest, TaskClaimer};

/// Settings for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub capabilities: Capabilities,
    pub lease: chrono::Duration,
    /// Idle wait between polls when nothing was claimable.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub task_types: Option<Vec<String>>,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            capabilities: config.capabilities.clone(),
            lease: config.lease_duration(),
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            task_types: None,
        }
    }

    fn claim_request(&self) -> ClaimRequest {
        let request = ClaimRequest::new(self.worker_id.clone(), self.lease)
            .capabilities(self.capabilities.clone());
        match &self.task_types {
            Some(types) => request.task_types(types.iter().cloned()),
            None => request,
        }
    }
}

/// What one pass of the loop did.
#[derive(Debug, Clone)]
pub enum Step {
    /// Nothing was claimable.
    Idle,
    /// The task was claimed, executed and resolved (completed, failed, or
    /// re-queued for retry).
    Resolved(Task),
    /// Ownership was lost before resolution; the result was dropped.
    Discarded(TaskId),
}

/// A single worker. Several may run in one process over a shared claimer.
pub struct WorkerLoop {
    claimer: Arc<TaskClaimer>,
    health: HealthMonitor,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl Clone for WorkerLoop {
    fn clone(&self) -> Self {
        Self {
            claimer: Arc::clone(&self.claimer),
            health: self.health.clone(),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
            processed: Arc::clone(&self.processed),
        }
    }
}

impl WorkerLoop {
    pub fn new(claimer: Arc<TaskClaimer>, health: HealthMonitor, config: WorkerConfig) -> Self {
        Self {
            claimer,
            health,
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Tasks this loop has resolved since it was created.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Ask the loop to stop. A task already in hand is finished first.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Register, then process tasks until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        self.health
            .register_worker(&self.config.worker_id, &self.config.capabilities)
            .await?;

        let heartbeat = AbortOnDrop(tokio::spawn(heartbeat_loop(
            self.health.clone(),
            self.config.worker_id.clone(),
            self.config.capabilities.clone(),
            self.config.heartbeat_interval,
        )));

        info!(worker_id = %self.config.worker_id, "worker started");

        while !self.stopping.load(Ordering::SeqCst) {
            let idle = match self.step().await {
                Ok(Step::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, "worker step failed: {e}");
                    true
                }
            };
            if !idle {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        drop(heartbeat);
        info!(
            worker_id = %self.config.worker_id,
            processed = self.processed(),
            "worker stopped"
        );
        Ok(())
    }

    /// Claim at most one task and carry it through to resolution.
    pub async fn step(&self) -> Result<Step> {
        let worker_id = self.config.worker_id.as_str();
        let Some(task) = self.claimer.claim(&self.config.claim_request()).await? else {
            return Ok(Step::Idle);
        };

        let span = start_task_span(&task.task_type, &task.id, worker_id);
        record_state_transition(
            &span,
            TaskStatus::Queued.as_str(),
            TaskStatus::Claimed.as_str(),
        );

        async {
            let started = match self.claimer.start(task.id, worker_id).await {
                Ok(t) => t,
                Err(Error::Ownership { owner, .. }) => {
                    warn!(task_id = %task.id, ?owner, "lost task before starting");
                    return Ok(Step::Discarded(task.id));
                }
                Err(e) => return Err(e),
            };
            record_state_transition(
                &span,
                TaskStatus::Claimed.as_str(),
                TaskStatus::Processing.as_str(),
            );

            let outcome = self.claimer.execute(&started).await;

            match self.claimer.resolve(task.id, worker_id, outcome).await {
                Ok(resolved) => {
                    record_state_transition(
                        &span,
                        TaskStatus::Processing.as_str(),
                        resolved.status.as_str(),
                    );
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    Ok(Step::Resolved(resolved))
                }
                Err(Error::Ownership { owner, .. }) => {
                    warn!(
                        task_id = %task.id,
                        ?owner,
                        "lease lost during execution, discarding result"
                    );
                    Ok(Step::Discarded(task.id))
                }
                Err(e) => Err(e),
            }
        }
        .instrument(span.clone())
        .await
    }
}

/// Aborts the wrapped task when dropped, including when the owning future
/// is cancelled mid-await.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn heartbeat_loop(
    health: HealthMonitor,
    worker_id: String,
    capabilities: Capabilities,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; registration just set the heartbeat.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match health.heartbeat(&worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%worker_id, "worker row missing, registering again");
                if let Err(e) = health.register_worker(&worker_id, &capabilities).await {
                    error!(%worker_id, "re-registration failed: {e}");
                }
            }
            Err(e) => error!(%worker_id, "heartbeat failed: {e}"),
        }
    }
}
