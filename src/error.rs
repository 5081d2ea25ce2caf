//! Error taxonomy for the lab harness.
//!
//! Only harness failures live here. A counter that loses updates or a bounded
//! acquisition that times out are outcomes, and they are reported as values.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("Unknown counter discipline '{0}' (expected none, mutex or atomic)")]
    UnknownDiscipline(String),

    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker '{0}' exited before registering as running")]
    WorkerNeverStarted(String),
}

impl LabError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }

    pub fn spawn(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            name: name.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

/// A panic caught at a worker's own boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFault {
    pub worker: String,
    pub message: String,
}

impl WorkerFault {
    /// Builds a fault from the payload handed back by `catch_unwind` or `join`.
    pub fn from_panic(worker: impl Into<String>, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self {
            worker: worker.into(),
            message,
        }
    }
}

impl std::fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker '{}' panicked: {}", self.worker, self.message)
    }
}
