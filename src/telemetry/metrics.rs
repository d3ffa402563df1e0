//! Metric instruments for the queue.
//!
//! Instruments come from the `"taskq"` meter on the global `MeterProvider`.
//! Until [`super::init_telemetry`] installs an OTLP pipeline the global
//! provider is a no-op, so recording is always safe.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq")
}

/// Counter: tasks accepted into the queue.
/// Labels: `task_type`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "empty" | "contended").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.claims")
        .with_description("Number of claim attempts by result")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: tasks whose lease expired and were taken back.
/// Labels: `outcome` ("requeued" | "failed").
pub fn leases_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("taskq.leases.reclaimed")
        .with_description("Number of expired leases reclaimed")
        .build()
}

/// Counter: transactions retried because the store was locked.
pub fn store_busy_retries() -> Counter<u64> {
    meter()
        .u64_counter("taskq.store.busy_retries")
        .with_description("Number of transactions retried on SQLITE_BUSY")
        .build()
}

/// Counter: maintenance job runs.
/// Labels: `job` ("reclaim" | "sweep" | "vacuum" | "checkpoint" | "backup"),
/// `result` ("ok" | "error").
pub fn maintenance_runs() -> Counter<u64> {
    meter()
        .u64_counter("taskq.maintenance.runs")
        .with_description("Number of maintenance job runs")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
