//! # taskq
//!
//! Durable task queue on a single embedded SQLite file.
//!
//! Workers in any number of processes claim tasks under a lease, execute
//! them, and resolve them as completed or failed. Failures retry with capped
//! exponential backoff; expired leases are reclaimed so a crashed worker's
//! tasks are not lost. The store file is the only shared state.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod retry;
pub mod scheduling;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
