use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::json;
use taskq::clock::ManualClock;
use taskq::engine::{ClaimRequest, TaskClaimer};
use taskq::health::HealthMonitor;
use taskq::model::{Capabilities, NewTask, TaskStatus};
use taskq::observability::get_queue_metrics;
use taskq::retry::{AttemptLimits, RetryPolicy};
use taskq::scheduling::SchedulingStrategy;
use taskq::store::{Store, StoreOptions};
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

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn empty_store_reports_zeros() {
    let (_dir, store, _clock) = test_store().await;
    let metrics = get_queue_metrics(&store, secs(30)).await.unwrap();

    assert_eq!(metrics.depth_by_status.len(), TaskStatus::ALL.len());
    assert!(metrics.depth_by_status.values().all(|n| *n == 0));
    assert!(metrics.depth_by_type.is_empty());
    assert_eq!(metrics.oldest_queued_age_seconds, None);
    assert_eq!(metrics.success_rate, 0.0);
    assert_eq!(metrics.failure_rate, 0.0);
    assert_eq!(metrics.active_workers, 0);
    assert_eq!(metrics.stale_workers, 0);
}

#[tokio::test]
async fn mixed_store_reports_depths_rates_and_workers() {
    let (_dir, store, clock) = test_store().await;
    let limits = AttemptLimits::default();
    let health = HealthMonitor::new(store.clone());
    health
        .register_worker("idle", &Capabilities::new())
        .await
        .unwrap();

    // Two completed, one failed, one cancelled.
    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo)
        .with_retry_policy(RetryPolicy::default().with_jitter(0.0));
    let request = ClaimRequest::new("w1", secs(60));
    for outcome in ["ok", "ok", "fail"] {
        store
            .enqueue(NewTask::new("done").max_attempts(1), &limits)
            .await
            .unwrap();
        let task = claimer.claim(&request).await.unwrap().unwrap();
        if outcome == "ok" {
            claimer.complete(task.id, "w1", json!(null)).await.unwrap();
        } else {
            claimer.fail(task.id, "w1", "broken").await.unwrap();
        }
    }
    let cancelled = store.enqueue(NewTask::new("done"), &limits).await.unwrap();
    store.cancel_task(cancelled.id).await.unwrap();

    // Live work: one queued long ago, one queued recently, one claimed.
    store
        .enqueue(NewTask::new("resize"), &limits)
        .await
        .unwrap();
    clock.advance(secs(90));
    health
        .register_worker("w1", &Capabilities::new())
        .await
        .unwrap();
    store
        .enqueue(NewTask::new("resize"), &limits)
        .await
        .unwrap();
    store
        .enqueue(NewTask::new("email").priority(-1), &limits)
        .await
        .unwrap();
    TaskClaimer::new(store.clone(), SchedulingStrategy::Priority)
        .claim(&request)
        .await
        .unwrap()
        .unwrap();

    let metrics = get_queue_metrics(&store, secs(30)).await.unwrap();

    assert_eq!(metrics.depth(TaskStatus::Queued), 2);
    assert_eq!(metrics.depth(TaskStatus::Claimed), 1);
    assert_eq!(metrics.depth(TaskStatus::Processing), 0);
    assert_eq!(metrics.depth(TaskStatus::Completed), 2);
    assert_eq!(metrics.depth(TaskStatus::Failed), 1);
    assert_eq!(metrics.depth(TaskStatus::Cancelled), 1);

    assert_eq!(metrics.depth_by_type.get("resize"), Some(&2));
    assert_eq!(metrics.depth_by_type.get("email"), Some(&1));
    assert_eq!(metrics.depth_by_type.get("done"), None);

    assert!((metrics.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((metrics.failure_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(metrics.oldest_queued_age_seconds, Some(90.0));

    assert_eq!(metrics.active_workers, 1);
    assert_eq!(metrics.stale_workers, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_read_during_writes_come_from_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path().join("q.db"), StoreOptions::default())
        .await
        .unwrap();

    let writer = tokio::spawn({
        let store = store.clone();
        async move {
            let limits = AttemptLimits::default();
            let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo);
            let request = ClaimRequest::new("w1", secs(60));
            for i in 0..150 {
                store.enqueue(NewTask::new("even"), &limits).await.unwrap();
                store.enqueue(NewTask::new("odd"), &limits).await.unwrap();
                if let Some(task) = claimer.claim(&request).await.unwrap() {
                    claimer.complete(task.id, "w1", json!(i)).await.unwrap();
                }
            }
        }
    });

    // Live depth by status and by type must always agree.
    loop {
        let done = writer.is_finished();
        let metrics = get_queue_metrics(&store, secs(30)).await.unwrap();
        let live = metrics.depth(TaskStatus::Queued)
            + metrics.depth(TaskStatus::Claimed)
            + metrics.depth(TaskStatus::Processing);
        assert_eq!(metrics.depth_by_type.values().sum::<u64>(), live);
        if done {
            break;
        }
    }
    writer.await.unwrap();
}
