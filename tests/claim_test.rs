use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use taskq::clock::{Clock, ManualClock};
use taskq::engine::{ClaimRequest, TaskClaimer};
use taskq::model::{NewTask, TaskId, TaskStatus};
use taskq::retry::AttemptLimits;
use taskq::scheduling::{SchedulingStrategy, StrategyKind};
use taskq::store::{Store, StoreOptions};
use tempfile::TempDir;

fn lease() -> chrono::Duration {
    chrono::Duration::seconds(60)
}

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

async fn enqueue(store: &Store, task: NewTask) -> TaskId {
    store
        .enqueue(task, &AttemptLimits::default())
        .await
        .unwrap()
        .id
}

// ---------------------------------------------------------------------------
// Selection order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_strategy_claims_most_urgent_first() {
    let (_dir, store, clock) = test_store().await;
    let low = enqueue(&store, NewTask::new("echo").priority(5)).await;
    clock.advance(chrono::Duration::seconds(1));
    let urgent = enqueue(&store, NewTask::new("echo").priority(1)).await;
    clock.advance(chrono::Duration::seconds(1));
    let urgent_later = enqueue(&store, NewTask::new("echo").priority(1)).await;

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Priority);
    let request = ClaimRequest::new("w1", lease());

    let order: Vec<TaskId> = [
        claimer.claim(&request).await.unwrap().unwrap().id,
        claimer.claim(&request).await.unwrap().unwrap().id,
        claimer.claim(&request).await.unwrap().unwrap().id,
    ]
    .into();
    assert_eq!(order, vec![urgent, urgent_later, low]);
    assert!(claimer.claim(&request).await.unwrap().is_none());
}

#[tokio::test]
async fn fifo_and_lifo_follow_creation_order() {
    let (_dir, store, clock) = test_store().await;
    let first = enqueue(&store, NewTask::new("echo").priority(9)).await;
    clock.advance(chrono::Duration::seconds(1));
    let middle = enqueue(&store, NewTask::new("echo")).await;
    clock.advance(chrono::Duration::seconds(1));
    let last = enqueue(&store, NewTask::new("echo").priority(1)).await;

    let fifo = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo);
    let lifo = TaskClaimer::new(store.clone(), SchedulingStrategy::Lifo);
    let request = ClaimRequest::new("w1", lease());

    assert_eq!(fifo.claim(&request).await.unwrap().unwrap().id, first);
    assert_eq!(lifo.claim(&request).await.unwrap().unwrap().id, last);
    assert_eq!(fifo.claim(&request).await.unwrap().unwrap().id, middle);
}

#[tokio::test]
async fn weighted_random_claims_everything_eventually() {
    let (_dir, store, _clock) = test_store().await;
    let mut expected = HashSet::new();
    for priority in 1..=6 {
        expected.insert(enqueue(&store, NewTask::new("echo").priority(priority)).await);
    }

    let claimer = TaskClaimer::new(store.clone(), StrategyKind::WeightedRandom.into()).with_seed(7);
    let request = ClaimRequest::new("w1", lease());

    let mut claimed = HashSet::new();
    while let Some(task) = claimer.claim(&request).await.unwrap() {
        claimed.insert(task.id);
    }
    assert_eq!(claimed, expected);
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claim_sets_owner_and_lease() {
    let (_dir, store, clock) = test_store().await;
    let id = enqueue(&store, NewTask::new("echo")).await;

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::default());
    let task = claimer
        .claim(&ClaimRequest::new("w1", lease()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(task.id, id);
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.claimed_by.as_deref(), Some("w1"));
    assert_eq!(task.claimed_at, Some(clock.now()));
    assert_eq!(task.lease_expires_at, Some(clock.now() + lease()));
    assert_eq!(task.attempt_count, 0);
}

#[tokio::test]
async fn requirements_must_be_contained_in_capabilities() {
    let (_dir, store, _clock) = test_store().await;
    let gpu_task = enqueue(
        &store,
        NewTask::new("render")
            .require("gpu", true)
            .require("vram_gb", 16),
    )
    .await;

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Priority);

    let cpu_only = ClaimRequest::new("cpu", lease()).capability("gpu", false);
    assert!(claimer.claim(&cpu_only).await.unwrap().is_none());

    let small_gpu = ClaimRequest::new("small", lease())
        .capability("gpu", true)
        .capability("vram_gb", 8);
    assert!(claimer.claim(&small_gpu).await.unwrap().is_none());

    let big_gpu = ClaimRequest::new("big", lease())
        .capability("gpu", true)
        .capability("vram_gb", 16)
        .capability("region", "eu");
    assert_eq!(claimer.claim(&big_gpu).await.unwrap().unwrap().id, gpu_task);
}

#[tokio::test]
async fn ineligible_candidates_do_not_hide_eligible_ones() {
    let (_dir, store, _clock) = test_store().await;
    for _ in 0..5 {
        let task = NewTask::new("render").priority(0).require("gpu", true);
        enqueue(&store, task).await;
    }
    let plain = enqueue(&store, NewTask::new("render").priority(9)).await;

    // Window smaller than the run of ineligible tasks forces paging.
    let claimer =
        TaskClaimer::new(store.clone(), SchedulingStrategy::Priority).with_candidate_window(2);
    let task = claimer
        .claim(&ClaimRequest::new("cpu", lease()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.id, plain);
}

#[tokio::test]
async fn type_filter_limits_candidates() {
    let (_dir, store, _clock) = test_store().await;
    enqueue(&store, NewTask::new("email").priority(0)).await;
    let resize = enqueue(&store, NewTask::new("resize").priority(5)).await;

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Priority);
    let request = ClaimRequest::new("w1", lease()).task_types(["resize", "thumbnail"]);
    assert_eq!(claimer.claim(&request).await.unwrap().unwrap().id, resize);
    assert!(claimer.claim(&request).await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_tasks_wait_for_not_before() {
    let (_dir, store, clock) = test_store().await;
    let delayed = NewTask::new("echo").delay(chrono::Duration::seconds(10));
    let id = enqueue(&store, delayed).await;

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo);
    let request = ClaimRequest::new("w1", lease());
    assert!(claimer.claim(&request).await.unwrap().is_none());

    clock.advance(chrono::Duration::seconds(10));
    assert_eq!(claimer.claim(&request).await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn claimed_and_cancelled_tasks_are_not_offered() {
    let (_dir, store, _clock) = test_store().await;
    let cancelled = enqueue(&store, NewTask::new("echo")).await;
    store.cancel_task(cancelled).await.unwrap();
    enqueue(&store, NewTask::new("echo")).await;

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo);
    let first = ClaimRequest::new("w1", lease());
    let second = ClaimRequest::new("w2", lease());
    assert!(claimer.claim(&first).await.unwrap().is_some());
    assert!(claimer.claim(&second).await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let (_dir, store, _clock) = test_store().await;
    let claimer = TaskClaimer::new(store, SchedulingStrategy::Fifo);
    let anonymous = ClaimRequest::new("", lease());
    let no_lease = ClaimRequest::new("w1", chrono::Duration::zero());
    assert!(claimer.claim(&anonymous).await.is_err());
    assert!(claimer.claim(&no_lease).await.is_err());
}

// ---------------------------------------------------------------------------
// Exclusivity under concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let options = StoreOptions {
        busy_timeout: Duration::from_secs(5),
        busy_retries: 50,
        ..StoreOptions::default()
    };
    let store = Store::open(dir.path().join("q.db"), options).await.unwrap();

    let total = 60;
    for i in 0..total {
        enqueue(&store, NewTask::new("echo").priority(i % 3)).await;
    }

    let claimer = Arc::new(TaskClaimer::new(store.clone(), SchedulingStrategy::Priority));
    let mut handles = Vec::new();
    for w in 0..8 {
        let claimer = Arc::clone(&claimer);
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{w}");
            let request = ClaimRequest::new(worker_id.clone(), lease());
            let mut mine = Vec::new();
            while let Some(task) = claimer.claim(&request).await.unwrap() {
                assert_eq!(task.claimed_by.as_deref(), Some(worker_id.as_str()));
                mine.push(task.id);
            }
            mine
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }

    // A claimer that lost every race in a row stops early; drain the rest.
    let request = ClaimRequest::new("drain", lease());
    while let Some(task) = claimer.claim(&request).await.unwrap() {
        claimed.push(task.id);
    }

    let unique: HashSet<TaskId> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len(), "a task was claimed twice");
    assert_eq!(claimed.len(), total as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separately_opened_stores_never_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("q.db");
    let store = Store::open(&path, StoreOptions::default()).await.unwrap();

    let total = 200;
    for i in 0..total {
        enqueue(&store, NewTask::new("echo").priority(i % 4)).await;
    }

    // Each claimer has its own pool, as separate processes would.
    let mut handles = Vec::new();
    for w in 0..10 {
        let path = path.clone();
        handles.push(tokio::spawn(async move {
            let options = StoreOptions {
                busy_retries: 50,
                ..StoreOptions::default()
            };
            let store = Store::open(&path, options).await.unwrap();
            let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Priority);
            let request = ClaimRequest::new(format!("w{w}"), lease());
            let mut mine = Vec::new();
            while let Some(task) = claimer.claim(&request).await.unwrap() {
                mine.push(task.id);
            }
            store.close().await;
            mine
        }));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }

    let claimer = TaskClaimer::new(store.clone(), SchedulingStrategy::Fifo);
    let request = ClaimRequest::new("drain", lease());
    while let Some(task) = claimer.claim(&request).await.unwrap() {
        claimed.push(task.id);
    }

    let unique: HashSet<TaskId> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len(), "a task was claimed twice");
    assert_eq!(claimed.len(), total as usize);
}
