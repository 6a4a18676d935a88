//! Run report

use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::MessagePayload;
use crate::correlator::{Arrival, Baseline};
use crate::error::ProbeResult;
use crate::workflow::{RunState, StepId, StepOutcome, StepStatus};

/// Exit status for a completed run.
pub const EXIT_OK: i32 = 0;
/// Exit status for an aborted run, or soft failures under `--strict`.
pub const EXIT_FAILED: i32 = 1;
/// Exit status when the run could not be set up.
pub const EXIT_SETUP: i32 = 2;

/// Result of one probe run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub state: RunState,
    pub payload: MessagePayload,
    pub baseline: Option<Baseline>,
    pub arrival: Option<Arrival>,
    /// Settled steps in execution order; steps after an abort are absent
    pub steps: Vec<StepOutcome>,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.state, RunState::Completed)
    }

    pub fn aborted_at(&self) -> Option<StepId> {
        match &self.state {
            RunState::Aborted { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Verification steps that recorded a mismatch.
    pub fn soft_failures(&self) -> Vec<&StepOutcome> {
        self.steps.iter().filter(|s| s.result == StepStatus::Fail).collect()
    }

    /// Steps that never started.
    pub fn not_run(&self) -> Vec<StepId> {
        StepId::ORDER
            .iter()
            .copied()
            .filter(|id| !self.steps.iter().any(|s| s.step == *id))
            .collect()
    }

    pub fn step(&self, id: StepId) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == id)
    }

    pub fn exit_code(&self, strict: bool) -> i32 {
        match self.state {
            RunState::Completed if strict && !self.soft_failures().is_empty() => EXIT_FAILED,
            RunState::Completed => EXIT_OK,
            _ => EXIT_FAILED,
        }
    }

    /// Write the report as pretty JSON into `dir`.
    pub fn write_json(&self, dir: &Path) -> ProbeResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("run-report.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Report written to: {}", path.display());
        Ok(path)
    }
}
