//! Run identifiers, statuses and records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::executor::RunOutput;

/// Identifier of a submitted run (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a run.
///
/// `Pending -> Running -> {Completed | Failed}`; a pending run may also fail
/// directly (admission failure, cancellation). Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, RunStatus::Running)
                | (Self::Pending, RunStatus::Failed)
                | (Self::Running, RunStatus::Completed)
                | (Self::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything known about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub model_id: String,
    pub status: RunStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set only when `Failed`.
    pub error: Option<SchedulerError>,
    /// Set only when `Completed`.
    pub output: Option<RunOutput>,
}

impl RunRecord {
    pub fn pending(run_id: RunId, model_id: impl Into<String>) -> Self {
        Self {
            run_id,
            model_id: model_id.into(),
            status: RunStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            output: None,
        }
    }

    /// Move to `Running`. Returns false if the transition is not allowed.
    pub fn mark_running(&mut self) -> bool {
        if !self.status.can_transition_to(RunStatus::Running) {
            return false;
        }
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Move to `Completed` with the run's output.
    pub fn complete(&mut self, output: RunOutput) -> bool {
        if !self.status.can_transition_to(RunStatus::Completed) {
            return false;
        }
        self.status = RunStatus::Completed;
        self.output = Some(output);
        self.ended_at = Some(Utc::now());
        true
    }

    /// Move to `Failed` with the given error.
    pub fn fail(&mut self, error: SchedulerError) -> bool {
        if !self.status.can_transition_to(RunStatus::Failed) {
            return false;
        }
        self.status = RunStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
        true
    }

    /// Wall time between start and end, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}
