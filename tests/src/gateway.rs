use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use accel_kernel::{ActivationGateway, GatewayError, GatewayResult};
use async_trait::async_trait;
use tokio::sync::RwLock;

/// One call received by a [`MockGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    Activate(String),
    Deactivate(String),
}

impl fmt::Display for GatewayCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activate(id) => write!(f, "activate {id}"),
            Self::Deactivate(id) => write!(f, "deactivate {id}"),
        }
    }
}

/// An in-memory activation gateway.
///
/// Tracks which models are physically active, records every call, and can
/// be told to fail or delay specific operations.
#[derive(Clone, Default)]
pub struct MockGateway {
    latency: Duration,
    active: Arc<RwLock<BTreeSet<String>>>,
    calls: Arc<RwLock<Vec<GatewayCall>>>,
    failing_activation: Arc<RwLock<HashSet<String>>>,
    failing_deactivation: Arc<RwLock<HashSet<String>>>,
    /// Remaining forced activation failures per model.
    flaky_activation: Arc<RwLock<HashMap<String, usize>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every activate/deactivate call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Models the gateway already reports as active before the scheduler starts.
    pub async fn preactivate(&self, ids: &[&str]) {
        self.active
            .write()
            .await
            .extend(ids.iter().map(|s| s.to_string()));
    }

    pub async fn fail_activation(&self, model_id: &str) {
        self.failing_activation.write().await.insert(model_id.to_string());
    }

    /// Fail the next `times` activations of `model_id`, then succeed.
    pub async fn fail_activation_times(&self, model_id: &str, times: usize) {
        self.flaky_activation
            .write()
            .await
            .insert(model_id.to_string(), times);
    }

    pub async fn fail_deactivation(&self, model_id: &str) {
        self.failing_deactivation
            .write()
            .await
            .insert(model_id.to_string());
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.calls.read().await.clone()
    }

    pub async fn activation_count(&self, model_id: &str) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| matches!(c, GatewayCall::Activate(id) if id == model_id))
            .count()
    }

    pub async fn is_active(&self, model_id: &str) -> bool {
        self.active.read().await.contains(model_id)
    }

    async fn should_fail_activation(&self, model_id: &str) -> bool {
        if self.failing_activation.read().await.contains(model_id) {
            return true;
        }
        let mut flaky = self.flaky_activation.write().await;
        match flaky.get_mut(model_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ActivationGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn activate(&self, model_id: &str) -> GatewayResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls
            .write()
            .await
            .push(GatewayCall::Activate(model_id.to_string()));
        if self.should_fail_activation(model_id).await {
            return Err(GatewayError::Backend(format!("{model_id} failed to load")));
        }
        self.active.write().await.insert(model_id.to_string());
        Ok(())
    }

    async fn deactivate(&self, model_id: &str) -> GatewayResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.calls
            .write()
            .await
            .push(GatewayCall::Deactivate(model_id.to_string()));
        if self.failing_deactivation.read().await.contains(model_id) {
            return Err(GatewayError::Rejected {
                model_id: model_id.to_string(),
                reason: "scale down refused".to_string(),
            });
        }
        self.active.write().await.remove(model_id);
        Ok(())
    }

    async fn active_models(&self) -> GatewayResult<Vec<String>> {
        Ok(self.active.read().await.iter().cloned().collect())
    }
}
