//! # threadlab
//!
//! A small laboratory for shared-memory concurrency: watch a counter lose
//! updates, fix it two different ways, walk into a lock-ordering deadlock,
//! and get out of it with a bounded wait.
//!
//! ## Pieces
//!
//! 1. **Counter strategies** ([`counter`]) - unsynchronized, mutex, atomic
//! 2. **Load driver** ([`driver`]) - N workers hammering one shared counter
//! 3. **Deadlock scenario** ([`deadlock`]) - two locks, opposite order, optional timeout
//! 4. **Lifecycle** ([`lifecycle`]) - cooperative stop flag and worker bookkeeping
//!
//! ## Running
//!
//! ```bash
//! cargo run -- race
//! cargo run -- deadlock --timeout-ms 500
//! cargo run -- deadlock --unmitigated
//! cargo run -- lifecycle
//! ```

pub mod config;
pub mod counter;
pub mod deadlock;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod report;

pub use config::LabConfig;
pub use counter::{AtomicCounter, Counter, Discipline, LockedCounter, UnsyncCounter};
pub use deadlock::{
    bounded_probe, AcquireOutcome, ContentionScenario, LockHandle, RoutineState, ScenarioParams,
    ScenarioReport, SecondLockMode,
};
pub use driver::{LoadDriver, LoadParams, LoadReport};
pub use error::{LabError, Result, WorkerFault};
pub use lifecycle::{Priority, StopFlag, Worker, WorkerBuilder, WorkerGroup, WorkerStatus};
