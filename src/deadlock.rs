//! Two locks, two routines, opposite acquisition order.
//!
//! Routine A takes L1 and then L2. Routine B takes L2 and then L1, either
//! unconditionally (which deadlocks), with a bounded wait (which times out
//! and lets A finish), or in the same order as A (no cycle at all).
//!
//! Nothing here detects or breaks a deadlock. The harness only bounds how
//! long it is willing to watch; stalled routines stay blocked.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{LabError, Result};
use crate::lifecycle::WorkerBuilder;

//==============================================================================
// Lock handle
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    TimedOut,
}

impl fmt::Display for AcquireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireOutcome::Acquired => f.write_str("acquired"),
            AcquireOutcome::TimedOut => f.write_str("timed-out"),
        }
    }
}

/// A named mutual-exclusion primitive guarding nothing but itself.
#[derive(Debug)]
pub struct LockHandle {
    name: String,
    lock: Mutex<()>,
}

impl LockHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the lock is held. There is no timeout.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Waits at most `timeout` for the lock.
    pub fn try_acquire_for(&self, timeout: Duration) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock_for(timeout)
    }
}

//==============================================================================
// Routine state
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineState {
    Idle,
    HoldingFirst,
    WaitingForSecond,
    Acquired,
    TimedOut,
}

impl RoutineState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RoutineState::HoldingFirst,
            2 => RoutineState::WaitingForSecond,
            3 => RoutineState::Acquired,
            4 => RoutineState::TimedOut,
            _ => RoutineState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RoutineState::Idle => 0,
            RoutineState::HoldingFirst => 1,
            RoutineState::WaitingForSecond => 2,
            RoutineState::Acquired => 3,
            RoutineState::TimedOut => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoutineState::Acquired | RoutineState::TimedOut)
    }

    /// The reported outcome of the second acquisition, once there is one.
    pub fn outcome(self) -> Option<AcquireOutcome> {
        match self {
            RoutineState::Acquired => Some(AcquireOutcome::Acquired),
            RoutineState::TimedOut => Some(AcquireOutcome::TimedOut),
            _ => None,
        }
    }
}

impl fmt::Display for RoutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutineState::Idle => "idle",
            RoutineState::HoldingFirst => "holding-first-lock",
            RoutineState::WaitingForSecond => "waiting-for-second-lock",
            RoutineState::Acquired => "acquired",
            RoutineState::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

/// Shared cell the harness reads while a routine may still be blocked.
#[derive(Debug, Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn set(&self, state: RoutineState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    fn get(&self) -> RoutineState {
        RoutineState::from_u8(self.0.load(Ordering::Acquire))
    }
}

//==============================================================================
// Scenario
//==============================================================================

/// How routine B goes after its second lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondLockMode {
    /// Opposite order, unconditional wait: deadlocks.
    Unconditional,
    /// Opposite order, bounded wait on L1.
    Bounded(Duration),
    /// Same order as routine A.
    Ordered,
}

impl fmt::Display for SecondLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecondLockMode::Unconditional => f.write_str("unconditional"),
            SecondLockMode::Bounded(t) => write!(f, "bounded({t:?})"),
            SecondLockMode::Ordered => f.write_str("ordered"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioParams {
    /// How long each routine sits on its first lock.
    pub hold: Duration,
    /// Deadline for the bounded acquisition.
    pub timeout: Duration,
    /// How long the harness watches before calling the run stalled.
    pub harness_wait: Duration,
}

impl Default for ScenarioParams {
    fn default() -> Self {
        Self {
            hold: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
            harness_wait: Duration::from_secs(4),
        }
    }
}

impl ScenarioParams {
    /// The harness must outlast the bounded path (hold, then the full
    /// timeout), or a run that would have timed out gets reported as stalled.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(LabError::invalid("timeout", "must be greater than 0"));
        }
        self.check_window(self.timeout)
    }

    fn check_window(&self, timeout: Duration) -> Result<()> {
        if self.harness_wait <= self.hold + timeout {
            return Err(LabError::invalid(
                "harness_wait",
                format!("must be longer than hold + timeout ({:?})", self.hold + timeout),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioReport {
    pub mode: SecondLockMode,
    pub routine_a: RoutineState,
    pub routine_b: RoutineState,
    /// Both routines returned within the harness wait.
    pub completed: bool,
    pub elapsed: Duration,
}

impl ScenarioReport {
    pub fn is_stalled(&self) -> bool {
        !self.completed
    }
}

/// Result of a single bounded acquisition against a lock held elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub outcome: AcquireOutcome,
    pub waited: Duration,
}

/// Every run gets its own pair of locks, so threads left blocked by a
/// stalled run never hold anything a later run needs.
#[derive(Debug)]
pub struct ContentionScenario {
    params: ScenarioParams,
}

impl ContentionScenario {
    pub fn new(params: ScenarioParams) -> Self {
        Self { params }
    }

    /// Routine B waits on L1 for at most the configured timeout.
    pub fn run_mitigated(&self) -> Result<ScenarioReport> {
        self.run(SecondLockMode::Bounded(self.params.timeout))
    }

    pub fn run_unmitigated(&self) -> Result<ScenarioReport> {
        self.run(SecondLockMode::Unconditional)
    }

    /// Runs both routines on their own threads and watches them for at most
    /// `harness_wait`.
    ///
    /// In the opposite-order modes both routines meet at a rendezvous after
    /// taking their first lock, so the contention window is guaranteed
    /// rather than left to the hold time.
    pub fn run(&self, mode: SecondLockMode) -> Result<ScenarioReport> {
        self.params.validate()?;
        if let SecondLockMode::Bounded(timeout) = mode {
            self.params.check_window(timeout)?;
        }

        let a_state = StateCell::default();
        let b_state = StateCell::default();
        let rendezvous = match mode {
            SecondLockMode::Ordered => None,
            _ => Some(Arc::new(Barrier::new(2))),
        };
        let first = Arc::new(LockHandle::new("L1"));
        let second = Arc::new(LockHandle::new("L2"));
        let (done_tx, done_rx) = channel::bounded::<&'static str>(2);
        let hold = self.params.hold;
        let started = Instant::now();

        let a = {
            let (l1, l2) = (Arc::clone(&first), Arc::clone(&second));
            let state = a_state.clone();
            let rendezvous = rendezvous.clone();
            let done = done_tx.clone();
            WorkerBuilder::new("routine-a").spawn(move || {
                routine_a(&l1, &l2, hold, rendezvous.as_deref(), &state);
                let _ = done.send("routine-a");
            })?
        };

        let b = {
            let (l1, l2) = (first, second);
            let state = b_state.clone();
            let done = done_tx;
            WorkerBuilder::new("routine-b").spawn(move || {
                routine_b(&l1, &l2, hold, mode, rendezvous.as_deref(), &state);
                let _ = done.send("routine-b");
            })?
        };

        let deadline = started + self.params.harness_wait;
        let mut finished = 0;
        while finished < 2 {
            match done_rx.recv_deadline(deadline) {
                Ok(name) => {
                    info!("{name} finished");
                    finished += 1;
                }
                Err(_) => break,
            }
        }

        let completed = finished == 2;
        if completed {
            for worker in [a, b] {
                if let Err(fault) = worker.join() {
                    warn!("{fault}");
                }
            }
        } else {
            warn!(
                "no progress after {:?}: routine-a is {}, routine-b is {}",
                self.params.harness_wait,
                a_state.get(),
                b_state.get()
            );
            a.detach();
            b.detach();
        }

        Ok(ScenarioReport {
            mode,
            routine_a: a_state.get(),
            routine_b: b_state.get(),
            completed,
            elapsed: started.elapsed(),
        })
    }
}

/// L1 then L2, both unconditional.
fn routine_a(
    l1: &LockHandle,
    l2: &LockHandle,
    hold: Duration,
    rendezvous: Option<&Barrier>,
    state: &StateCell,
) {
    let _first = l1.acquire();
    state.set(RoutineState::HoldingFirst);
    if let Some(barrier) = rendezvous {
        barrier.wait();
    }
    thread::sleep(hold);

    state.set(RoutineState::WaitingForSecond);
    let _second = l2.acquire();
    state.set(RoutineState::Acquired);
}

/// L2 then L1 in the opposite-order modes, L1 then L2 when ordered.
fn routine_b(
    l1: &LockHandle,
    l2: &LockHandle,
    hold: Duration,
    mode: SecondLockMode,
    rendezvous: Option<&Barrier>,
    state: &StateCell,
) {
    let (first, second) = match mode {
        SecondLockMode::Ordered => (l1, l2),
        _ => (l2, l1),
    };

    let _first = first.acquire();
    state.set(RoutineState::HoldingFirst);
    if let Some(barrier) = rendezvous {
        barrier.wait();
    }
    thread::sleep(hold);

    state.set(RoutineState::WaitingForSecond);
    match mode {
        SecondLockMode::Bounded(timeout) => match second.try_acquire_for(timeout) {
            Some(_second) => state.set(RoutineState::Acquired),
            None => {
                info!("timed out waiting for {}", second.name());
                state.set(RoutineState::TimedOut);
            }
        },
        SecondLockMode::Unconditional | SecondLockMode::Ordered => {
            let _second = second.acquire();
            state.set(RoutineState::Acquired);
        }
    }
}

/// Holds a fresh lock on another thread for `hold`, then tries to take it
/// from the caller's thread with a `timeout` deadline.
pub fn bounded_probe(hold: Duration, timeout: Duration) -> Result<ProbeReport> {
    let lock = Arc::new(LockHandle::new("probe"));
    let (held_tx, held_rx) = channel::bounded::<()>(0);

    let holder = {
        let lock = Arc::clone(&lock);
        WorkerBuilder::new("probe-holder").spawn(move || {
            let _guard = lock.acquire();
            let _ = held_tx.send(());
            thread::sleep(hold);
        })?
    };

    // The holder owns the lock once this returns.
    if held_rx.recv().is_err() {
        return Err(LabError::WorkerNeverStarted(holder.name().to_string()));
    }

    let started = Instant::now();
    let outcome = match lock.try_acquire_for(timeout) {
        Some(_guard) => AcquireOutcome::Acquired,
        None => AcquireOutcome::TimedOut,
    };
    let waited = started.elapsed();

    if let Err(fault) = holder.join() {
        warn!("{fault}");
    }
    Ok(ProbeReport { outcome, waited })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> ScenarioParams {
        ScenarioParams {
            hold: Duration::from_millis(50),
            timeout: Duration::from_millis(200),
            harness_wait: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_lock_handle_name() {
        assert_eq!(LockHandle::new("a").name(), "a");
    }

    #[test]
    fn test_try_acquire_on_free_lock() {
        let lock = LockHandle::new("free");
        assert!(lock.try_acquire_for(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_bounded_probe_times_out_when_holder_outlasts_deadline() {
        let timeout = Duration::from_millis(100);
        let probe = bounded_probe(Duration::from_millis(600), timeout).unwrap();
        assert_eq!(probe.outcome, AcquireOutcome::TimedOut);
        assert!(probe.waited >= timeout);
        assert!(probe.waited < Duration::from_millis(500));
    }

    #[test]
    fn test_bounded_probe_acquires_after_holder_releases() {
        let probe = bounded_probe(Duration::from_millis(50), Duration::from_secs(2)).unwrap();
        assert_eq!(probe.outcome, AcquireOutcome::Acquired);
        assert!(probe.waited < Duration::from_secs(2));
    }

    #[test]
    fn test_bounded_mode_converts_deadlock_into_timeout() {
        let scenario = ContentionScenario::new(fast_params());
        let report = scenario.run_mitigated().unwrap();

        assert_eq!(report.mode, SecondLockMode::Bounded(Duration::from_millis(200)));
        assert!(report.completed);
        assert_eq!(report.routine_b, RoutineState::TimedOut);
        assert_eq!(report.routine_b.outcome(), Some(AcquireOutcome::TimedOut));
        // B releases L2 after giving up, so A gets through.
        assert_eq!(report.routine_a, RoutineState::Acquired);
    }

    #[test]
    fn test_ordered_mode_completes_both_routines() {
        let scenario = ContentionScenario::new(fast_params());
        let report = scenario.run(SecondLockMode::Ordered).unwrap();
        assert!(report.completed);
        assert_eq!(report.routine_a, RoutineState::Acquired);
        assert_eq!(report.routine_b, RoutineState::Acquired);
    }

    #[test]
    fn test_unconditional_mode_never_returns() {
        let params = ScenarioParams {
            hold: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            harness_wait: Duration::from_millis(500),
        };
        let scenario = ContentionScenario::new(params);
        let report = scenario.run_unmitigated().unwrap();

        assert!(report.is_stalled());
        assert_eq!(report.routine_a, RoutineState::WaitingForSecond);
        assert_eq!(report.routine_b, RoutineState::WaitingForSecond);
        assert_eq!(report.routine_a.outcome(), None);
        // The harness gave up, not the locks.
        assert!(report.elapsed >= params.harness_wait);
    }

    #[test]
    fn test_scenario_is_reusable_after_a_stall() {
        let params = ScenarioParams {
            hold: Duration::from_millis(20),
            timeout: Duration::from_millis(100),
            harness_wait: Duration::from_millis(500),
        };
        let scenario = ContentionScenario::new(params);
        assert!(scenario.run_unmitigated().unwrap().is_stalled());

        let ordered = scenario.run(SecondLockMode::Ordered).unwrap();
        assert!(ordered.completed);
        assert_eq!(ordered.routine_a, RoutineState::Acquired);
        assert_eq!(ordered.routine_b, RoutineState::Acquired);

        let mitigated = scenario.run_mitigated().unwrap();
        assert!(mitigated.completed);
        assert_eq!(mitigated.routine_b, RoutineState::TimedOut);
    }

    #[test]
    fn test_harness_wait_must_outlast_bounded_wait() {
        let params = ScenarioParams {
            hold: Duration::from_millis(50),
            timeout: Duration::from_millis(600),
            harness_wait: Duration::from_millis(300),
        };
        assert!(matches!(
            params.validate(),
            Err(LabError::InvalidParameter { field: "harness_wait", .. })
        ));

        let exact = ScenarioParams {
            harness_wait: Duration::from_millis(650),
            ..params
        };
        assert!(exact.validate().is_err());

        let enough = ScenarioParams {
            harness_wait: Duration::from_secs(2),
            ..params
        };
        assert!(enough.validate().is_ok());
        let report = ContentionScenario::new(enough).run_mitigated().unwrap();
        assert!(report.completed);
        assert_eq!(report.routine_b, RoutineState::TimedOut);
    }

    #[test]
    fn test_bounded_mode_longer_than_harness_is_rejected() {
        let scenario = ContentionScenario::new(fast_params());
        assert!(matches!(
            scenario.run(SecondLockMode::Bounded(Duration::from_secs(10))),
            Err(LabError::InvalidParameter { field: "harness_wait", .. })
        ));
    }

    #[test]
    fn test_harness_wait_must_exceed_hold() {
        let params = ScenarioParams {
            hold: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            harness_wait: Duration::from_millis(500),
        };
        let scenario = ContentionScenario::new(params);
        assert!(matches!(
            scenario.run(SecondLockMode::Ordered),
            Err(LabError::InvalidParameter { field: "harness_wait", .. })
        ));
    }

    #[test]
    fn test_state_cell_round_trip() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), RoutineState::Idle);
        for state in [
            RoutineState::HoldingFirst,
            RoutineState::WaitingForSecond,
            RoutineState::Acquired,
            RoutineState::TimedOut,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AcquireOutcome::Acquired.to_string(), "acquired");
        assert_eq!(AcquireOutcome::TimedOut.to_string(), "timed-out");
        assert!(RoutineState::TimedOut.is_terminal());
        assert!(!RoutineState::WaitingForSecond.is_terminal());
    }
}
