//! Error types for the round-trip probe

use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correlator::Baseline;

/// How a failure should be treated by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Expected to clear up after a short delay or an alternate action.
    Transient,
    /// The expected external state is absent; retrying cannot help.
    Structural,
    /// A polled condition did not become true within its budget.
    Timeout,
    /// A new event was observed but it was not the one this run caused.
    Correlation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Structural => "structural",
            FailureKind::Timeout => "timeout",
            FailureKind::Correlation => "correlation",
        }
    }
}

/// Failures raised by an automation driver.
///
/// Cloneable so a failure can be handed to a fallback and still be reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("element not found: {0}")]
    NotFound(String),

    #[error("element not interactable: {0}")]
    NotInteractable(String),

    #[error("stale element reference: {0}")]
    Stale(String),

    #[error("malformed page structure: {0}")]
    Malformed(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl DriverError {
    /// Lookup failures that mean "not there yet" rather than "broken".
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            DriverError::NotFound(_) | DriverError::Stale(_) | DriverError::NotInteractable(_)
        )
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        DriverError::Transport(e.to_string())
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Orchestrator-level errors.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("retries exhausted after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: DriverError },

    #[error("timed out after {:.1}s waiting for {what}", .elapsed.as_secs_f64())]
    Timeout { what: String, elapsed: Duration },

    #[error("no new mail arrived within {:.1}s (baseline: {baseline})", .elapsed.as_secs_f64())]
    ArrivalTimeout { elapsed: Duration, baseline: Baseline },

    #[error("mail from a different originator arrived during the run: expected {expected:?}, observed {observed:?} (subject {subject:?})")]
    Correlation {
        expected: String,
        observed: String,
        subject: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProbeError {
    /// Classify this error for reporting.
    ///
    /// A driver error that reaches this point escaped every retry, so it is
    /// structural whatever its class inside the wrapper.
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::RetriesExhausted { .. } => FailureKind::Transient,
            ProbeError::Timeout { .. } | ProbeError::ArrivalTimeout { .. } => FailureKind::Timeout,
            ProbeError::Correlation { .. } => FailureKind::Correlation,
            _ => FailureKind::Structural,
        }
    }

    /// Attempts made before giving up, when the error records them.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ProbeError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;
