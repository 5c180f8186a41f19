//! Scheduler error taxonomy.
//!
//! [`SchedulerError`] is returned by every scheduler operation and is also
//! stored inside a failed [`RunRecord`](crate::run::RunRecord), which is why
//! it is `Clone` and serializable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by admission, deactivation and run execution.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SchedulerError {
    /// The model id is not in the registry.
    #[error("model not found: {model_id}")]
    ModelNotFound { model_id: String },

    /// The model cannot fit even after evicting every eligible victim.
    #[error("insufficient budget for {model_id}: requires {required}, available {available}")]
    InsufficientBudget {
        model_id: String,
        required: u64,
        available: u64,
    },

    /// The activation gateway refused, failed or timed out.
    #[error("activation of {model_id} failed: {reason}")]
    ActivationFailed { model_id: String, reason: String },

    /// The model has runs in progress and cannot be deactivated.
    #[error("model {model_id} is busy with {running} running run(s)")]
    ModelBusy { model_id: String, running: usize },

    /// Always-on models are only deactivated by the administrative override.
    #[error("model {model_id} is always-on and cannot be deactivated")]
    CannotDeactivateAlwaysOn { model_id: String },

    /// The run was cancelled before it obtained a concurrency slot.
    #[error("run cancelled before execution")]
    Cancelled,

    /// The run function itself returned an error or panicked.
    #[error("run execution failed: {reason}")]
    ExecutionFailed { reason: String },

    /// The scheduler is shutting down and accepts no new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    pub fn model_not_found(model_id: impl Into<String>) -> Self {
        Self::ModelNotFound {
            model_id: model_id.into(),
        }
    }

    pub fn activation_failed(model_id: impl Into<String>, reason: impl ToString) -> Self {
        Self::ActivationFailed {
            model_id: model_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn execution_failed(reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            reason: reason.into(),
        }
    }

    /// Whether a later attempt could succeed without any change in state.
    ///
    /// Only gateway failures qualify; budget and lookup failures are decided
    /// by scheduler state and would fail identically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ActivationFailed { .. })
    }

    /// Stable snake_case name of the variant, for logs and API surfaces.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "model_not_found",
            Self::InsufficientBudget { .. } => "insufficient_budget",
            Self::ActivationFailed { .. } => "activation_failed",
            Self::ModelBusy { .. } => "model_busy",
            Self::CannotDeactivateAlwaysOn { .. } => "cannot_deactivate_always_on",
            Self::Cancelled => "cancelled",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
