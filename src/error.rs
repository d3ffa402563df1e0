//! Error types for taskq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration or bad input to a queue operation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The store stayed busy/locked through every internal retry.
    #[error("store is locked: gave up after {attempts} attempts")]
    LockContention { attempts: u32 },

    /// The caller does not own the task: it was reclaimed, resolved, or never
    /// claimed by them.
    #[error(
        "worker {worker_id} does not own task {task_id} (owner: {})",
        owner.as_deref().unwrap_or("none")
    )]
    Ownership {
        task_id: String,
        worker_id: String,
        owner: Option<String>,
    },

    #[error("schema version mismatch: store has {found}, this build expects {expected}")]
    SchemaVersionMismatch { found: i64, expected: i64 },

    #[error("backup failed: {0}")]
    BackupFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
