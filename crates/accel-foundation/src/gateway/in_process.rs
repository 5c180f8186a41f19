//! In-process activation: model weights loaded into this process.

use std::collections::BTreeMap;
use std::sync::Arc;

use accel_kernel::{ActivationGateway, GatewayError, GatewayResult, RunExecutor, RunOutput};
use async_trait::async_trait;
use tracing::info;

/// Error type returned by backends.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// A model whose weights can be loaded into accelerator memory.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Unique identifier, matching the registry id.
    fn model_id(&self) -> &str;

    /// Load the weights.
    async fn load(&self) -> Result<(), BackendError>;

    /// Free the weights.
    async fn unload(&self) -> Result<(), BackendError>;

    fn is_loaded(&self) -> bool;

    /// Run one inference on the loaded model.
    async fn infer(&self, payload: serde_json::Value) -> Result<RunOutput, BackendError>;
}

/// Gateway and executor over a fixed set of [`ModelBackend`]s.
#[derive(Default, Clone)]
pub struct InProcessGateway {
    backends: BTreeMap<String, Arc<dyn ModelBackend>>,
}

impl InProcessGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backends
            .insert(backend.model_id().to_string(), backend);
        self
    }

    pub fn backend(&self, model_id: &str) -> Option<&Arc<dyn ModelBackend>> {
        self.backends.get(model_id)
    }

    fn require(&self, model_id: &str) -> GatewayResult<&Arc<dyn ModelBackend>> {
        self.backends
            .get(model_id)
            .ok_or_else(|| GatewayError::UnknownModel(model_id.to_string()))
    }
}

#[async_trait]
impl ActivationGateway for InProcessGateway {
    fn name(&self) -> &str {
        "in-process"
    }

    async fn activate(&self, model_id: &str) -> GatewayResult<()> {
        let backend = self.require(model_id)?;
        if backend.is_loaded() {
            return Ok(());
        }
        backend
            .load()
            .await
            .map_err(|e| GatewayError::Backend(e.to_string()))?;
        info!(model_id, "weights loaded");
        Ok(())
    }

    async fn deactivate(&self, model_id: &str) -> GatewayResult<()> {
        let backend = self.require(model_id)?;
        if !backend.is_loaded() {
            return Ok(());
        }
        backend
            .unload()
            .await
            .map_err(|e| GatewayError::Backend(e.to_string()))?;
        info!(model_id, "weights unloaded");
        Ok(())
    }

    async fn active_models(&self) -> GatewayResult<Vec<String>> {
        Ok(self
            .backends
            .values()
            .filter(|b| b.is_loaded())
            .map(|b| b.model_id().to_string())
            .collect())
    }
}

#[async_trait]
impl RunExecutor for InProcessGateway {
    async fn execute(
        &self,
        model_id: &str,
        payload: serde_json::Value,
    ) -> Result<RunOutput, String> {
        let backend = self.require(model_id).map_err(|e| e.to_string())?;
        if !backend.is_loaded() {
            return Err(format!("model {model_id} is not loaded"));
        }
        backend.infer(payload).await.map_err(|e| e.to_string())
    }
}
