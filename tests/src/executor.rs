use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use accel_kernel::{RunExecutor, RunOutput};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// A [`RunExecutor`] with per-model scripted outcomes.
///
/// Models without a script echo their payload back.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    delay: Duration,
    outcomes: Arc<RwLock<HashMap<String, Result<RunOutput, String>>>>,
    history: Arc<RwLock<Vec<(String, Value)>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated inference time for every run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn set_output(&self, model_id: &str, output: RunOutput) {
        self.outcomes
            .write()
            .await
            .insert(model_id.to_string(), Ok(output));
    }

    pub async fn set_failure(&self, model_id: &str, reason: &str) {
        self.outcomes
            .write()
            .await
            .insert(model_id.to_string(), Err(reason.to_string()));
    }

    /// Every `(model_id, payload)` executed so far.
    pub async fn history(&self) -> Vec<(String, Value)> {
        self.history.read().await.clone()
    }
}

#[async_trait]
impl RunExecutor for ScriptedExecutor {
    async fn execute(&self, model_id: &str, payload: Value) -> Result<RunOutput, String> {
        self.history
            .write()
            .await
            .push((model_id.to_string(), payload.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.outcomes.read().await.get(model_id) {
            Some(outcome) => outcome.clone(),
            None => Ok(payload),
        }
    }
}
