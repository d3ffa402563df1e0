use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use taskq::clock::{Clock, ManualClock};
use taskq::engine::{ClaimRequest, TaskClaimer};
use taskq::error::Error;
use taskq::model::{NewTask, TaskId, TaskStatus};
use taskq::retry::AttemptLimits;
use taskq::scheduling::SchedulingStrategy;
use taskq::store::tasks::TaskFilter;
use taskq::store::{SCHEMA_VERSION, Store, StoreOptions};
use tempfile::TempDir;

/// Helper: fresh store in a temp dir on a manual clock.
async fn test_store() -> (TempDir, Store, Arc<ManualClock>) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
    let store = Store::open_with_clock(
        dir.path().join("q.db"),
        StoreOptions::default(),
        clock.clone(),
    )
    .await
    .unwrap();
    (dir, store, clock)
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[tokio::test]
async fn open_creates_file_and_stamps_schema() {
    let (dir, store, _clock) = test_store().await;
    assert!(dir.path().join("q.db").exists());
    assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
    assert!(store.health_check().await.is_ok());

    // Re-running schema init is harmless.
    store.init_schema().await.unwrap();
    assert_eq!(store.schema_version().await.unwrap(), SCHEMA_VERSION);
}

#[tokio::test]
async fn reopening_keeps_existing_tasks() {
    let (dir, store, _clock) = test_store().await;
    let task = store
        .enqueue(NewTask::new("echo"), &AttemptLimits::default())
        .await
        .unwrap();
    store.close().await;

    let reopened = Store::open(dir.path().join("q.db"), StoreOptions::default())
        .await
        .unwrap();
    assert_eq!(reopened.get_task(task.id).await.unwrap().id, task.id);
}

#[tokio::test]
async fn schema_version_mismatch_is_fatal() {
    let (dir, store, _clock) = test_store().await;
    store.close().await;

    let path = dir.path().join("q.db");
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    sqlx::query("UPDATE schema_meta SET value = '99' WHERE key = 'schema_version'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let err = Store::open(&path, StoreOptions::default())
        .await
        .unwrap_err();
    let Error::SchemaVersionMismatch { found, expected } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(*found, 99);
    assert_eq!(*expected, SCHEMA_VERSION);
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_then_get_returns_the_same_task() {
    let (_dir, store, clock) = test_store().await;

    let task = store
        .enqueue(
            NewTask::new("resize")
                .payload(json!({"w": 640}))
                .priority(2)
                .require("gpu", true),
            &AttemptLimits::default(),
        )
        .await
        .unwrap();

    let fetched = store.get_task(task.id).await.unwrap();
    assert_eq!(fetched, task);
    assert_eq!(fetched.status, TaskStatus::Queued);
    assert_eq!(fetched.max_attempts, 3);
    assert_eq!(fetched.attempt_count, 0);
    assert_eq!(fetched.created_at, clock.now());
    assert_eq!(fetched.not_before, fetched.created_at);
    assert!(fetched.claimed_by.is_none());
}

#[tokio::test]
async fn enqueue_applies_per_type_limits_and_delay() {
    let (_dir, store, _clock) = test_store().await;
    let limits = AttemptLimits::new(3).with_type("email", 6);

    let email = store.enqueue(NewTask::new("email"), &limits).await.unwrap();
    assert_eq!(email.max_attempts, 6);

    let explicit = store
        .enqueue(NewTask::new("email").max_attempts(1), &limits)
        .await
        .unwrap();
    assert_eq!(explicit.max_attempts, 1);

    let delayed = store
        .enqueue(
            NewTask::new("echo").delay(chrono::Duration::seconds(30)),
            &limits,
        )
        .await
        .unwrap();
    assert_eq!(
        delayed.not_before - delayed.created_at,
        chrono::Duration::seconds(30)
    );
}

#[tokio::test]
async fn enqueue_rejects_invalid_tasks() {
    let (_dir, store, _clock) = test_store().await;
    let limits = AttemptLimits::default();

    assert!(matches!(
        store.enqueue(NewTask::new("  "), &limits).await,
        Err(Error::Validation(_))
    ));
    let zero_attempts = NewTask::new("echo").max_attempts(0);
    assert!(matches!(
        store.enqueue(zero_attempts, &limits).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (_dir, store, _clock) = test_store().await;
    assert!(matches!(
        store.get_task(TaskId::new()).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn list_filters_by_status_and_type() {
    let (_dir, store, _clock) = test_store().await;
    let limits = AttemptLimits::default();
    for task_type in ["a", "a", "b"] {
        store
            .enqueue(NewTask::new(task_type), &limits)
            .await
            .unwrap();
    }
    let cancelled = store.enqueue(NewTask::new("b"), &limits).await.unwrap();
    store.cancel_task(cancelled.id).await.unwrap();

    let all = store.list_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(all.len(), 4);

    let a = store
        .list_tasks(&TaskFilter {
            task_type: Some("a".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(a.len(), 2);

    let queued_b = store
        .list_tasks(&TaskFilter {
            status: Some(TaskStatus::Queued),
            task_type: Some("b".into()),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(queued_b.len(), 1);

    let limited = store
        .list_tasks(&TaskFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn cancel_only_applies_to_queued_tasks() {
    let (_dir, store, _clock) = test_store().await;
    let task = store
        .enqueue(NewTask::new("echo"), &AttemptLimits::default())
        .await
        .unwrap();

    let cancelled = store.cancel_task(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let again = store.cancel_task(task.id).await.unwrap_err();
    let Error::InvalidTransition { from, to } = &again else {
        panic!("unexpected error: {again}");
    };
    assert_eq!((from.as_str(), to.as_str()), ("cancelled", "cancelled"));
}

#[tokio::test]
async fn cancel_rejects_claimed_and_resolved_tasks() {
    let (_dir, store, _clock) = test_store().await;
    let task = store
        .enqueue(NewTask::new("echo"), &AttemptLimits::default())
        .await
        .unwrap();
    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo);
    let request = ClaimRequest::new("w1", chrono::Duration::seconds(60));
    claimer.claim(&request).await.unwrap().unwrap();

    let err = store.cancel_task(task.id).await.unwrap_err();
    let Error::InvalidTransition { from, to } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!((from.as_str(), to.as_str()), ("claimed", "cancelled"));
    assert_eq!(
        store.get_task(task.id).await.unwrap().status,
        TaskStatus::Claimed
    );

    claimer.complete(task.id, "w1", json!(null)).await.unwrap();
    let err = store.cancel_task(task.id).await.unwrap_err();
    let Error::InvalidTransition { from, .. } = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(from, "completed");
}

// ---------------------------------------------------------------------------
// Contention
// ---------------------------------------------------------------------------

#[tokio::test]
async fn held_write_lock_surfaces_as_lock_contention() {
    let (dir, store, _clock) = test_store().await;
    let path = dir.path().join("q.db");
    let impatient = Store::open(
        &path,
        StoreOptions {
            busy_timeout: Duration::from_millis(20),
            busy_retries: 3,
            ..StoreOptions::default()
        },
    )
    .await
    .unwrap();

    // A foreign connection takes the write lock and keeps it.
    let holder = sqlx::SqlitePool::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    let mut conn = holder.acquire().await.unwrap();
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .unwrap();

    let err = impatient
        .enqueue(NewTask::new("echo"), &AttemptLimits::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::LockContention { attempts: 3 }),
        "unexpected error: {err}"
    );

    sqlx::query("ROLLBACK").execute(&mut *conn).await.unwrap();
    drop(conn);
    holder.close().await;

    impatient
        .enqueue(NewTask::new("echo"), &AttemptLimits::default())
        .await
        .unwrap();
    let tasks = store.list_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(tasks.len(), 1);
}

