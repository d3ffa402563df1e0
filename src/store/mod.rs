//! SQLite storage engine.
//!
//! Single source of truth for all task and worker state. The file is opened
//! in WAL mode so readers never block the single writer, and any number of
//! OS processes may open the same path. Every mutation runs inside
//! [`Store::with_transaction`], which takes the write lock up front
//! (`BEGIN IMMEDIATE`) and retries transparently while another process holds it.

pub mod maintenance;
pub mod stats;
pub mod tasks;
pub mod workers;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Schema version stamped into every store. Bump on any DDL change.
pub const SCHEMA_VERSION: i64 = 1;

/// Boxed future returned by a transaction body.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

/// Connection and contention settings.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Pool size. Writers still serialize on SQLite's single write lock.
    pub max_connections: u32,
    /// How long SQLite itself waits on a lock before reporting busy.
    pub busy_timeout: Duration,
    /// Transaction attempts before giving up with `LockContention`.
    pub busy_retries: u32,
    /// First retry delay; doubles per attempt, jittered.
    pub busy_base_delay: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_millis(250),
            busy_retries: 8,
            busy_base_delay: Duration::from_millis(10),
        }
    }
}

/// Store handle. Cheap to clone; clones share the pool and clock.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    path: PathBuf,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a store at `path` using the wall clock.
    pub async fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_with_clock(path, options, Arc::new(SystemClock)).await
    }

    /// Open or create a store with an injected clock.
    ///
    /// Fails with `SchemaVersionMismatch` if the file was stamped by a
    /// different schema version.
    pub async fn open_with_clock(
        path: impl AsRef<Path>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let connect = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect_with(connect)
            .await?;

        let store = Self {
            pool,
            clock,
            options,
            path,
        };
        store.init_schema().await?;
        debug!(path = %store.path.display(), "store opened");
        Ok(store)
    }

    /// Create tables and indices if absent and check the schema stamp.
    ///
    /// Idempotent: safe to call from every process on every start.
    pub async fn init_schema(&self) -> Result<()> {
        self.with_transaction(|conn| {
            Box::pin(async move {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS schema_meta (
                        key   TEXT PRIMARY KEY,
                        value TEXT NOT NULL
                    )",
                )
                .execute(&mut *conn)
                .await?;

                let stamped: Option<(String,)> =
                    sqlx::query_as("SELECT value FROM schema_meta WHERE key = 'schema_version'")
                        .fetch_optional(&mut *conn)
                        .await?;

                if let Some((raw,)) = stamped {
                    let found: i64 = raw.parse().map_err(|_| {
                        Error::Other(format!("unreadable schema version stamp: {raw}"))
                    })?;
                    if found != SCHEMA_VERSION {
                        return Err(Error::SchemaVersionMismatch {
                            found,
                            expected: SCHEMA_VERSION,
                        });
                    }
                }

                for statement in SCHEMA {
                    sqlx::query(statement).execute(&mut *conn).await?;
                }

                sqlx::query(
                    "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)
                     ON CONFLICT (key) DO NOTHING",
                )
                .bind(SCHEMA_VERSION.to_string())
                .execute(&mut *conn)
                .await?;

                Ok(())
            })
        })
        .await
    }

    /// Schema version recorded in the store.
    pub async fn schema_version(&self) -> Result<i64> {
        let (raw,): (String,) =
            sqlx::query_as("SELECT value FROM schema_meta WHERE key = 'schema_version'")
                .fetch_one(&self.pool)
                .await?;
        raw.parse()
            .map_err(|_| Error::Other(format!("unreadable schema version stamp: {raw}")))
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute `op` inside a write transaction.
    ///
    /// Commits if `op` returns `Ok`, rolls back on `Err`. If the store is
    /// busy or locked by another connection, the whole body is retried with
    /// jittered exponential delay; after `busy_retries` attempts the call
    /// fails with [`Error::LockContention`]. Any other error propagates as is.
    ///
    /// `op` may run more than once, so it must only capture owned data.
    pub async fn with_transaction<T, F>(&self, mut op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> TxFuture<'c, T> + Send,
    {
        let max_attempts = self.options.busy_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.try_transaction(&mut op).await {
                Err(Error::Storage(ref e)) if is_busy(e) => {
                    metrics::store_busy_retries().add(1, &[]);
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, "store stayed locked, giving up");
                        return Err(Error::LockContention { attempts: attempt });
                    }
                    let delay = busy_delay(self.options.busy_base_delay, attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn try_transaction<T, F>(&self, op: &mut F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut SqliteConnection) -> TxFuture<'c, T> + Send,
    {
        let conn = self.pool.acquire().await?;
        let mut guard = TxGuard { conn, open: false };

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *guard.conn)
            .await?;
        guard.open = true;

        match op(&mut *guard.conn).await {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *guard.conn).await?;
                guard.open = false;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *guard.conn).await {
                    warn!("rollback failed: {rollback}");
                } else {
                    guard.open = false;
                }
                Err(e)
            }
        }
    }
}

/// Keeps a connection whose transaction was abandoned mid-flight (the
/// future was dropped, or COMMIT failed) out of the pool.
struct TxGuard {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if self.open {
            self.conn.close_on_drop();
        }
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes,
/// plus pool exhaustion.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn busy_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(10));
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    exp.mul_f64(jitter)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tasks (
        id                TEXT PRIMARY KEY,
        task_type         TEXT NOT NULL,
        status            TEXT NOT NULL DEFAULT 'queued',
        payload           TEXT NOT NULL DEFAULT 'null',
        requirements      TEXT NOT NULL DEFAULT '{}',
        priority          INTEGER NOT NULL DEFAULT 0,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL,
        claimed_by        TEXT,
        claimed_at        INTEGER,
        lease_expires_at  INTEGER,
        not_before        INTEGER NOT NULL DEFAULT 0,
        attempt_count     INTEGER NOT NULL DEFAULT 0,
        max_attempts      INTEGER NOT NULL,
        reclaim_count     INTEGER NOT NULL DEFAULT 0,
        last_error        TEXT,
        result            TEXT,
        completed_at      INTEGER,
        CHECK ((claimed_by IS NOT NULL) = (status IN ('claimed', 'processing'))),
        CHECK (attempt_count <= max_attempts)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_priority
        ON tasks(status, priority, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_type
        ON tasks(status, task_type)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_lease
        ON tasks(lease_expires_at) WHERE lease_expires_at IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_tasks_completed
        ON tasks(completed_at) WHERE completed_at IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS workers (
        worker_id              TEXT PRIMARY KEY,
        capabilities           TEXT NOT NULL DEFAULT '{}',
        registered_at          INTEGER NOT NULL,
        last_heartbeat         INTEGER NOT NULL,
        tasks_processed_count  INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_workers_heartbeat ON workers(last_heartbeat)",
    "CREATE TABLE IF NOT EXISTS tasks_archive (
        id                TEXT PRIMARY KEY,
        task_type         TEXT NOT NULL,
        status            TEXT NOT NULL,
        payload           TEXT NOT NULL,
        requirements      TEXT NOT NULL,
        priority          INTEGER NOT NULL,
        created_at        INTEGER NOT NULL,
        updated_at        INTEGER NOT NULL,
        claimed_by        TEXT,
        claimed_at        INTEGER,
        lease_expires_at  INTEGER,
        not_before        INTEGER NOT NULL,
        attempt_count     INTEGER NOT NULL,
        max_attempts      INTEGER NOT NULL,
        reclaim_count     INTEGER NOT NULL,
        last_error        TEXT,
        result            TEXT,
        completed_at      INTEGER,
        archived_at       INTEGER NOT NULL
    )",
];
