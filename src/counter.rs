//! Counter strategies: one contract, three synchronization disciplines.
//!
//! The load driver only ever sees `dyn Counter`, so swapping the discipline
//! is the single change between a run that loses updates and one that does not.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::LabError;

/// The capability set shared by every strategy.
pub trait Counter: Send + Sync {
    fn increment(&self);
    fn decrement(&self);
    fn read(&self) -> i64;
    fn discipline(&self) -> Discipline;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    None,
    Mutex,
    Atomic,
}

impl Discipline {
    pub const ALL: [Discipline; 3] = [Discipline::None, Discipline::Mutex, Discipline::Atomic];

    /// Builds a fresh, zeroed counter of this discipline.
    pub fn counter(self) -> Arc<dyn Counter> {
        match self {
            Discipline::None => Arc::new(UnsyncCounter::new()),
            Discipline::Mutex => Arc::new(LockedCounter::new()),
            Discipline::Atomic => Arc::new(AtomicCounter::new()),
        }
    }

    /// Whether the final value is guaranteed to equal the algebraic sum.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, Discipline::None)
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Discipline::None => "none",
            Discipline::Mutex => "mutex",
            Discipline::Atomic => "atomic",
        };
        f.write_str(name)
    }
}

impl FromStr for Discipline {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "unsync" => Ok(Discipline::None),
            "mutex" | "lock" => Ok(Discipline::Mutex),
            "atomic" => Ok(Discipline::Atomic),
            other => Err(LabError::UnknownDiscipline(other.to_string())),
        }
    }
}

//==============================================================================
// Negative control: no synchronization
//==============================================================================

/// Read-modify-write as two separate steps: a load, then a store.
///
/// Concurrent callers interleave between the two steps and overwrite each
/// other's results. The cell is still an atomic so the race is a logical one
/// (lost updates) rather than undefined behaviour. Do not use this as a pattern.
#[derive(Debug, Default)]
pub struct UnsyncCounter {
    value: AtomicI64,
}

impl UnsyncCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, delta: i64) {
        let current = self.value.load(Ordering::Relaxed);
        self.value.store(current + delta, Ordering::Relaxed);
    }
}

impl Counter for UnsyncCounter {
    fn increment(&self) {
        self.add(1);
    }

    fn decrement(&self) {
        self.add(-1);
    }

    fn read(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn discipline(&self) -> Discipline {
        Discipline::None
    }
}

//==============================================================================
// Lock-protected
//==============================================================================

/// Every read-modify-write happens inside the guard's scope.
#[derive(Debug, Default)]
pub struct LockedCounter {
    value: Mutex<i64>,
}

impl LockedCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Counter for LockedCounter {
    fn increment(&self) {
        *self.value.lock() += 1;
    }

    fn decrement(&self) {
        *self.value.lock() -= 1;
    }

    fn read(&self) -> i64 {
        *self.value.lock()
    }

    fn discipline(&self) -> Discipline {
        Discipline::Mutex
    }
}

//==============================================================================
// Atomic
//==============================================================================

/// Hardware fetch-and-add. Relaxed is enough: each RMW is indivisible and
/// the final read happens after every worker has been joined.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Counter for AtomicCounter {
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    fn read(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn discipline(&self) -> Discipline {
        Discipline::Atomic
    }
}
