//! Concurrent load driver.
//!
//! Fans `workers` threads out over one shared counter. Every worker runs the
//! same paired loop (increment, then decrement) so the mathematically
//! expected final value is always zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use log::{info, warn};

use crate::counter::{Counter, Discipline};
use crate::error::{LabError, Result, WorkerFault};
use crate::lifecycle::{StopFlag, Worker, WorkerBuilder};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParams {
    pub workers: usize,
    pub iterations: u64,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            workers: 3,
            iterations: 100_000,
        }
    }
}

impl LoadParams {
    pub fn new(workers: usize, iterations: u64) -> Self {
        Self {
            workers,
            iterations,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(LabError::invalid("workers", "must be greater than 0"));
        }
        if self.iterations == 0 {
            return Err(LabError::invalid("iterations", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Result of one load run.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub discipline: Discipline,
    pub params: LoadParams,
    pub final_value: i64,
    pub expected: i64,
    /// Paired cycles each worker finished, in spawn order.
    pub completed: Vec<u64>,
    pub faults: Vec<WorkerFault>,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn is_consistent(&self) -> bool {
        self.final_value == self.expected
    }

    pub fn deviation(&self) -> i64 {
        self.final_value - self.expected
    }

    pub fn total_cycles(&self) -> u64 {
        self.completed.iter().sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadDriver {
    params: LoadParams,
    stop: Option<StopFlag>,
}

impl LoadDriver {
    pub fn new(params: LoadParams) -> Self {
        Self { params, stop: None }
    }

    /// Workers poll `stop` between cycles and leave early once it is raised.
    pub fn with_stop(mut self, stop: StopFlag) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn run_discipline(&self, discipline: Discipline) -> Result<LoadReport> {
        self.run(discipline.counter())
    }

    /// Runs the paired loop on every worker and reads the counter once all
    /// of them have been joined.
    pub fn run(&self, counter: Arc<dyn Counter>) -> Result<LoadReport> {
        self.params.validate()?;

        let discipline = counter.discipline();
        let abort = StopFlag::new();
        // Nothing is ever sent; dropping the sender opens the gate for everyone at once.
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let mut workers: Vec<Worker<u64>> = Vec::with_capacity(self.params.workers);
        let mut progress: Vec<Arc<AtomicU64>> = Vec::with_capacity(self.params.workers);

        for id in 0..self.params.workers {
            let counter = Arc::clone(&counter);
            let gate = gate_rx.clone();
            let worker_abort = abort.clone();
            let stop = self.stop.clone();
            let iterations = self.params.iterations;
            let cycles = Arc::new(AtomicU64::new(0));
            let worker_cycles = Arc::clone(&cycles);

            let spawned = WorkerBuilder::new(format!("load-worker-{id}")).spawn(move || {
                let _ = gate.recv();
                let mut done = 0;
                while done < iterations {
                    if worker_abort.should_stop()
                        || stop.as_ref().is_some_and(StopFlag::should_stop)
                    {
                        break;
                    }
                    counter.increment();
                    counter.decrement();
                    done += 1;
                    worker_cycles.store(done, Ordering::Relaxed);
                }
                done
            });

            match spawned {
                Ok(worker) => {
                    workers.push(worker);
                    progress.push(cycles);
                }
                Err(err) => {
                    abandon(&abort, gate_tx, workers);
                    return Err(err);
                }
            }
        }

        if let Err(err) = await_registration(&workers, REGISTER_TIMEOUT) {
            abandon(&abort, gate_tx, workers);
            return Err(err);
        }

        info!(
            "{} workers registered, running {} cycles each on the '{}' counter",
            workers.len(),
            self.params.iterations,
            discipline
        );

        let started = Instant::now();
        drop(gate_tx);

        let mut completed = Vec::with_capacity(workers.len());
        let mut faults = Vec::new();
        for (worker, cycles) in workers.into_iter().zip(&progress) {
            match worker.join() {
                Ok(done) => completed.push(done),
                Err(fault) => {
                    warn!("{fault}");
                    // Cycles finished before the panic; the one in flight is not counted.
                    completed.push(cycles.load(Ordering::Relaxed));
                    faults.push(fault);
                }
            }
        }

        Ok(LoadReport {
            discipline,
            params: self.params,
            final_value: counter.read(),
            expected: 0,
            completed,
            faults,
            elapsed: started.elapsed(),
        })
    }

    /// Runs each discipline in turn on a fresh counter.
    pub fn compare(&self, disciplines: &[Discipline]) -> Result<Vec<LoadReport>> {
        disciplines.iter().map(|&d| self.run_discipline(d)).collect()
    }

    /// Repeats a run `trials` times and counts the runs whose final value
    /// missed the expected one.
    pub fn deviation_trials(&self, discipline: Discipline, trials: usize) -> Result<usize> {
        let mut deviated = 0;
        for _ in 0..trials {
            if !self.run_discipline(discipline)?.is_consistent() {
                deviated += 1;
            }
        }
        Ok(deviated)
    }
}

/// Fails with the first worker that has not registered as running within `timeout`.
fn await_registration<T>(workers: &[Worker<T>], timeout: Duration) -> Result<()> {
    match workers.iter().find(|w| !w.wait_started(timeout)) {
        Some(idle) => Err(LabError::WorkerNeverStarted(idle.name().to_string())),
        None => Ok(()),
    }
}

/// Releases and joins workers that were spawned before a setup failure.
fn abandon(abort: &StopFlag, gate: channel::Sender<()>, workers: Vec<Worker<u64>>) {
    abort.request_stop();
    drop(gate);
    for worker in workers {
        let _ = worker.join();
    }
}
