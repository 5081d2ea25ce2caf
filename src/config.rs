//! Lab parameters, loadable from TOML.
//!
//! Every field has a default, so an empty file (or no file) reproduces the
//! reference run: 3 workers, 100 000 cycles each, a 2 second bounded wait.
//!
//! ```toml
//! [load]
//! workers = 4
//! disciplines = ["mutex", "atomic"]
//!
//! [deadlock]
//! timeout_ms = 500
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::counter::Discipline;
use crate::deadlock::ScenarioParams;
use crate::driver::LoadParams;
use crate::error::{LabError, Result};
use crate::lifecycle::Priority;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfig {
    pub load: LoadSection,
    pub deadlock: DeadlockSection,
    pub lifecycle: LifecycleSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadSection {
    pub workers: usize,
    pub iterations: u64,
    pub disciplines: Vec<Discipline>,
    /// Repeated runs used to show that the unsynchronized counter drifts.
    pub trials: usize,
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            workers: 3,
            iterations: 100_000,
            disciplines: Discipline::ALL.to_vec(),
            trials: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeadlockSection {
    pub hold_ms: u64,
    pub timeout_ms: u64,
    pub harness_wait_ms: u64,
}

impl Default for DeadlockSection {
    fn default() -> Self {
        Self {
            hold_ms: 1_000,
            timeout_ms: 2_000,
            harness_wait_ms: 4_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleSection {
    pub ticks: usize,
    pub tick_ms: u64,
    pub stop_after_ms: u64,
    pub spin_ms: u64,
    pub high_priority: Priority,
    pub low_priority: Priority,
    pub affinity: Option<usize>,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            ticks: 15,
            tick_ms: 100,
            stop_after_ms: 1_000,
            spin_ms: 2_000,
            high_priority: Priority::Highest,
            low_priority: Priority::Lowest,
            affinity: None,
        }
    }
}

impl LabConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: LabConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| LabError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.load_params().validate()?;
        if self.load.disciplines.is_empty() {
            return Err(LabError::invalid("disciplines", "at least one is required"));
        }
        if self.load.trials == 0 {
            return Err(LabError::invalid("trials", "must be greater than 0"));
        }
        self.scenario_params().validate()?;
        if self.lifecycle.tick_ms == 0 {
            return Err(LabError::invalid("tick_ms", "must be greater than 0"));
        }
        Ok(())
    }

    pub fn load_params(&self) -> LoadParams {
        LoadParams::new(self.load.workers, self.load.iterations)
    }

    pub fn scenario_params(&self) -> ScenarioParams {
        ScenarioParams {
            hold: Duration::from_millis(self.deadlock.hold_ms),
            timeout: Duration::from_millis(self.deadlock.timeout_ms),
            harness_wait: Duration::from_millis(self.deadlock.harness_wait_ms),
        }
    }
}
