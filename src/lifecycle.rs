//! Cooperative lifecycle control for worker threads.
//!
//! Rust has no way to kill a thread from the outside, and neither does this
//! crate. A worker stops because it polls a [`StopFlag`] and returns.
//!
//! The rest of the module is bookkeeping around `std::thread::Builder`:
//! names, a background/foreground flag, priority and affinity hints, and an
//! observable status. Hints are recorded and reported; they never change how
//! a worker is scheduled.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::error;
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

use crate::error::{LabError, Result, WorkerFault};

//==============================================================================
// Stop flag
//==============================================================================

/// Single-writer, many-reader stop signal.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    raised: Arc<AtomicBool>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. Raising it again changes nothing.
    pub fn request_stop(&self) {
        self.raised.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}

//==============================================================================
// Hints
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Lowest => "Lowest",
            Priority::BelowNormal => "BelowNormal",
            Priority::Normal => "Normal",
            Priority::AboveNormal => "AboveNormal",
            Priority::Highest => "Highest",
        };
        f.pad(name)
    }
}

//==============================================================================
// Worker status
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Unstarted,
    Running,
    Finished,
    Faulted,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Finished | WorkerStatus::Faulted)
    }
}

#[derive(Debug)]
struct StatusCell {
    status: Mutex<WorkerStatus>,
    changed: Condvar,
}

impl StatusCell {
    fn new() -> Self {
        Self {
            status: Mutex::new(WorkerStatus::Unstarted),
            changed: Condvar::new(),
        }
    }

    fn set(&self, status: WorkerStatus) {
        *self.status.lock() = status;
        self.changed.notify_all();
    }

    fn get(&self) -> WorkerStatus {
        *self.status.lock()
    }

    /// Waits until the worker has left `Unstarted`, or the timeout passes.
    fn wait_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while *status == WorkerStatus::Unstarted {
            if self.changed.wait_until(&mut status, deadline).timed_out() {
                return *status != WorkerStatus::Unstarted;
            }
        }
        true
    }
}

//==============================================================================
// Worker builder and handle
//==============================================================================

/// Describes a worker before it is spawned.
#[derive(Debug, Clone)]
pub struct WorkerBuilder {
    name: String,
    background: bool,
    priority: Priority,
    affinity: Option<usize>,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            background: false,
            priority: Priority::Normal,
            affinity: None,
        }
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Preferred core. Recorded only.
    pub fn affinity(mut self, core: Option<usize>) -> Self {
        self.affinity = core;
        self
    }

    /// Spawns the worker on a named OS thread.
    ///
    /// The body runs behind `catch_unwind`: a panic is logged by the worker
    /// itself and comes back from [`Worker::join`] as a [`WorkerFault`].
    /// The status is set to `Running` before any user code executes.
    pub fn spawn<F, T>(self, body: F) -> Result<Worker<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let status = Arc::new(StatusCell::new());
        let thread_status = Arc::clone(&status);
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                thread_status.set(WorkerStatus::Running);
                match catch_unwind(AssertUnwindSafe(body)) {
                    Ok(value) => {
                        thread_status.set(WorkerStatus::Finished);
                        Ok(value)
                    }
                    Err(payload) => {
                        let fault = WorkerFault::from_panic(name, &*payload);
                        error!("fault handled: {}", fault.message);
                        thread_status.set(WorkerStatus::Faulted);
                        Err(fault)
                    }
                }
            })
            .map_err(|err| LabError::spawn(self.name.clone(), err))?;

        Ok(Worker {
            name: self.name,
            background: self.background,
            priority: self.priority,
            affinity: self.affinity,
            status,
            handle: Some(handle),
        })
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct Worker<T> {
    name: String,
    background: bool,
    priority: Priority,
    affinity: Option<usize>,
    status: Arc<StatusCell>,
    handle: Option<JoinHandle<std::result::Result<T, WorkerFault>>>,
}

impl<T> Worker<T> {
    /// A handle whose thread never ran.
    #[cfg(test)]
    pub(crate) fn unstarted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            background: false,
            priority: Priority::Normal,
            affinity: None,
            status: Arc::new(StatusCell::new()),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn affinity(&self) -> Option<usize> {
        self.affinity
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.get()
    }

    /// Blocks until the worker registers as running, up to `timeout`.
    pub fn wait_started(&self, timeout: Duration) -> bool {
        self.status.wait_started(timeout)
    }

    /// Blocks until the worker's thread has fully terminated.
    pub fn join(mut self) -> std::result::Result<T, WorkerFault> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                // Only reachable if the fault boundary itself panicked.
                Err(payload) => Err(WorkerFault::from_panic(self.name.clone(), &*payload)),
            },
            None => Err(WorkerFault {
                worker: self.name.clone(),
                message: "worker already joined".to_string(),
            }),
        }
    }

    /// Drops the join handle; the thread keeps running on its own.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

//==============================================================================
// Worker group
//==============================================================================

/// What happened to each worker when the group shut down.
#[derive(Debug)]
pub struct GroupOutcome<T> {
    pub joined: Vec<(String, std::result::Result<T, WorkerFault>)>,
    pub detached: Vec<String>,
}

/// A set of workers sharing one stop flag.
///
/// Foreground workers are waited for. Background workers are asked to stop
/// and then left to finish on their own, like daemon threads.
#[derive(Debug)]
pub struct WorkerGroup<T> {
    stop: StopFlag,
    workers: Vec<Worker<T>>,
}

impl<T> WorkerGroup<T> {
    pub fn new(stop: StopFlag) -> Self {
        Self {
            stop,
            workers: Vec::new(),
        }
    }

    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }

    pub fn push(&mut self, worker: Worker<T>) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn statuses(&self) -> Vec<(&str, WorkerStatus)> {
        self.workers.iter().map(|w| (w.name(), w.status())).collect()
    }

    /// Joins every foreground worker, then stops and detaches the background ones.
    pub fn join_foreground(self) -> GroupOutcome<T> {
        let (background, foreground): (Vec<_>, Vec<_>) =
            self.workers.into_iter().partition(|w| w.is_background());

        let joined = foreground
            .into_iter()
            .map(|w| {
                let name = w.name().to_string();
                (name, w.join())
            })
            .collect();

        self.stop.request_stop();
        let detached = background
            .into_iter()
            .map(|w| {
                let name = w.name().to_string();
                w.detach();
                name
            })
            .collect();

        GroupOutcome { joined, detached }
    }
}

//==============================================================================
// Cooperative loops
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub completed: usize,
    pub stopped: bool,
}

/// Runs `body` up to `ticks` times, sleeping `period` after each call.
///
/// The flag is checked before every tick, so a raised flag ends the loop
/// within one period.
pub fn run_ticks<F>(flag: &StopFlag, ticks: usize, period: Duration, mut body: F) -> TickOutcome
where
    F: FnMut(usize),
{
    let mut completed = 0;
    for tick in 0..ticks {
        if flag.should_stop() {
            return TickOutcome {
                completed,
                stopped: true,
            };
        }
        body(tick);
        completed += 1;
        thread::sleep(period);
    }
    TickOutcome {
        completed,
        stopped: false,
    }
}

/// Counts loop iterations until the flag is raised.
pub fn spin_until_stopped(flag: &StopFlag) -> u64 {
    let mut count: u64 = 0;
    while !flag.should_stop() {
        count = count.wrapping_add(1);
        std::hint::spin_loop();
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_stop_flag_defaults_to_false() {
        let flag = StopFlag::new();
        assert!(!flag.should_stop());
    }

    #[test]
    fn test_request_stop_is_idempotent() {
        let once = StopFlag::new();
        once.request_stop();

        let twice = StopFlag::new();
        twice.request_stop();
        twice.request_stop();

        assert_eq!(once.should_stop(), twice.should_stop());
        assert!(twice.should_stop());
    }

    #[test]
    fn test_stop_flag_visible_across_clones() {
        let flag = StopFlag::new();
        let reader = flag.clone();
        flag.request_stop();
        assert!(reader.should_stop());
    }

    #[test]
    fn test_run_ticks_runs_full_count_without_stop() {
        let flag = StopFlag::new();
        let outcome = run_ticks(&flag, 5, Duration::from_millis(1), |_| {});
        assert_eq!(
            outcome,
            TickOutcome {
                completed: 5,
                stopped: false
            }
        );
    }

    #[test]
    fn test_run_ticks_exits_within_one_period() {
        let flag = StopFlag::new();
        let worker_flag = flag.clone();
        let period = Duration::from_millis(20);

        let worker = WorkerBuilder::new("ticker")
            .spawn(move || run_ticks(&worker_flag, 10_000, period, |_| {}))
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        let raised_at = Instant::now();
        flag.request_stop();
        let outcome = worker.join().unwrap();

        assert!(outcome.stopped);
        assert!(outcome.completed < 10_000);
        // One period of sleep plus generous scheduling slack.
        assert!(raised_at.elapsed() < period * 10);
    }

    #[test]
    fn test_spin_until_stopped_returns_count() {
        let flag = StopFlag::new();
        let worker_flag = flag.clone();
        let worker = WorkerBuilder::new("spinner")
            .spawn(move || spin_until_stopped(&worker_flag))
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        flag.request_stop();
        assert!(worker.join().unwrap() > 0);
    }

    #[test]
    fn test_worker_status_transitions() {
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let worker = WorkerBuilder::new("status").spawn(move || rx.recv()).unwrap();

        assert!(worker.wait_started(Duration::from_secs(5)));
        assert_eq!(worker.status(), WorkerStatus::Running);

        drop(tx);
        assert!(worker.join().is_ok());
    }

    #[test]
    fn test_worker_finished_status_after_join() {
        let worker = WorkerBuilder::new("quick").spawn(|| 7).unwrap();
        let status = Arc::clone(&worker.status);
        assert_eq!(worker.join().unwrap(), 7);
        assert_eq!(status.get(), WorkerStatus::Finished);
    }

    #[test]
    fn test_worker_panic_is_caught_and_reported() {
        let worker = WorkerBuilder::new("faulty")
            .spawn(|| -> u32 { panic!("Boom!") })
            .unwrap();
        let status = Arc::clone(&worker.status);

        let fault = worker.join().unwrap_err();
        assert_eq!(fault.worker, "faulty");
        assert_eq!(fault.message, "Boom!");
        assert_eq!(status.get(), WorkerStatus::Faulted);
        assert!(status.get().is_terminal());
    }

    #[test]
    fn test_thread_name_matches_builder() {
        let worker = WorkerBuilder::new("named-worker")
            .spawn(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(worker.join().unwrap().as_deref(), Some("named-worker"));
    }

    #[test]
    fn test_hints_are_recorded() {
        let worker = WorkerBuilder::new("hinted")
            .priority(Priority::Highest)
            .affinity(Some(0))
            .background(true)
            .spawn(|| ())
            .unwrap();
        assert_eq!(worker.priority(), Priority::Highest);
        assert_eq!(worker.affinity(), Some(0));
        assert!(worker.is_background());
        worker.join().unwrap();
    }

    #[test]
    fn test_group_joins_foreground_and_detaches_background() {
        let stop = StopFlag::new();
        let mut group = WorkerGroup::new(stop.clone());
        let finished = Arc::new(AtomicUsize::new(0));

        let fg_finished = Arc::clone(&finished);
        group.push(
            WorkerBuilder::new("foreground")
                .spawn(move || {
                    fg_finished.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap(),
        );

        let bg_flag = stop.clone();
        group.push(
            WorkerBuilder::new("background")
                .background(true)
                .spawn(move || {
                    spin_until_stopped(&bg_flag);
                })
                .unwrap(),
        );
        assert_eq!(group.len(), 2);

        let outcome = group.join_foreground();
        assert_eq!(outcome.joined.len(), 1);
        assert_eq!(outcome.joined[0].0, "foreground");
        assert!(outcome.joined[0].1.is_ok());
        assert_eq!(outcome.detached, vec!["background".to_string()]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(stop.should_stop());
    }

    #[test]
    fn test_group_statuses_while_running_and_after() {
        let stop = StopFlag::new();
        let mut group = WorkerGroup::new(stop.clone());
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);

        let waiter = WorkerBuilder::new("waiter")
            .spawn(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        assert!(waiter.wait_started(Duration::from_secs(5)));
        group.push(waiter);

        let quick = WorkerBuilder::new("quick").spawn(|| ()).unwrap();
        let quick_status = Arc::clone(&quick.status);
        group.push(quick);
        while !quick_status.get().is_terminal() {
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(
            group.statuses(),
            vec![
                ("waiter", WorkerStatus::Running),
                ("quick", WorkerStatus::Finished)
            ]
        );

        drop(release_tx);
        let outcome = group.join_foreground();
        assert!(outcome.joined.iter().all(|(_, result)| result.is_ok()));
    }

    #[test]
    fn test_unstarted_handle_never_registers() {
        let worker: Worker<()> = Worker::unstarted("idle");
        assert_eq!(worker.status(), WorkerStatus::Unstarted);
        assert!(!worker.wait_started(Duration::from_millis(10)));
    }

    #[test]
    fn test_priority_display_pads() {
        assert_eq!(format!("{:>8}", Priority::Lowest), "  Lowest");
    }
}
