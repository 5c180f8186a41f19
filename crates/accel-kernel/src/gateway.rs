//! Activation gateway contract.
//!
//! The scheduler decides *whether* a model may hold accelerator memory; an
//! [`ActivationGateway`] performs the side effect. Implementations include a
//! deployment replica scaler and an in-process weight loader, both in
//! `accel-foundation`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by an activation gateway.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The gateway could not reach its backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered but refused the request.
    #[error("{model_id} rejected: {reason}")]
    Rejected { model_id: String, reason: String },

    /// The call did not complete in time.
    #[error("{0} timed out after {1:?}")]
    Timeout(String, Duration),

    /// The gateway has no mapping for this model.
    #[error("gateway has no backend for model {0}")]
    UnknownModel(String),

    /// The backend failed while loading or unloading.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Performs the physical activation and deactivation of models.
///
/// Calls for the same model are never issued concurrently by the scheduler,
/// and `activate` is only called for models the scheduler considers inactive.
#[async_trait]
pub trait ActivationGateway: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Make the model able to serve runs.
    async fn activate(&self, model_id: &str) -> GatewayResult<()>;

    /// Release the model's accelerator memory.
    async fn deactivate(&self, model_id: &str) -> GatewayResult<()>;

    /// Models the backend currently reports as active.
    ///
    /// Used once at start to rebuild scheduler state. The default reports
    /// nothing, so every model starts inactive.
    async fn active_models(&self) -> GatewayResult<Vec<String>> {
        Ok(Vec::new())
    }
}
