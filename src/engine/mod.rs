//! Worker-side engine: claiming, execution, worker loops and housekeeping.

pub mod claimer;
pub mod executor;
pub mod housekeeper;
pub mod worker;

pub use claimer::{ClaimRequest, TaskClaimer};
pub use executor::{EchoExecutor, ExecutionOutcome, Executor};
pub use housekeeper::{CycleReport, Housekeeper, HousekeeperConfig};
pub use worker::{Step, WorkerConfig, WorkerLoop};
