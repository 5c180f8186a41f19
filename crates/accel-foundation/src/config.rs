//! Scheduler configuration.
//!
//! Loaded from any format the kernel config loader supports. Loading errors
//! are returned as [`error_stack::Report`]s carrying the file path.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use accel_kernel::config::{self as loader, ConfigError};
use accel_kernel::{GatewayResult, ModelDescriptor, ModelRegistry, ModelTier, RegistryError};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::gateway::{ReplicaScalerConfig, ReplicaScalerGateway};
use crate::retry::RetryConfig;

/// One entry of the model catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default = "default_tier")]
    pub tier: ModelTier,
    pub memory_cost: u64,
    /// Ignored for always-on models.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Deployment name for the replica scaling gateway.
    #[serde(default)]
    pub deployment: Option<String>,
}

fn default_tier() -> ModelTier {
    ModelTier::OnDemand
}

fn default_idle_timeout_secs() -> u64 {
    1_800
}

impl ModelSpec {
    pub fn always_on(id: impl Into<String>, memory_cost: u64) -> Self {
        Self {
            id: id.into(),
            tier: ModelTier::AlwaysOn,
            memory_cost,
            idle_timeout_secs: 0,
            deployment: None,
        }
    }

    pub fn on_demand(id: impl Into<String>, memory_cost: u64, idle_timeout_secs: u64) -> Self {
        Self {
            id: id.into(),
            tier: ModelTier::OnDemand,
            memory_cost,
            idle_timeout_secs,
            deployment: None,
        }
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        match self.tier {
            ModelTier::AlwaysOn => ModelDescriptor::always_on(&self.id, self.memory_cost),
            ModelTier::OnDemand => ModelDescriptor::on_demand(
                &self.id,
                self.memory_cost,
                Duration::from_secs(self.idle_timeout_secs),
            ),
        }
    }
}

/// Everything needed to build a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Accelerator memory shared by all active models.
    pub total_budget: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// Upper bound on a single gateway call.
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,
    /// How long a run may wait for a slot before it is cancelled.
    #[serde(default)]
    pub queue_timeout_secs: Option<u64>,
    /// How long completed and failed run records are kept.
    #[serde(default)]
    pub finished_retention_secs: Option<u64>,
    #[serde(default)]
    pub activation_retry: RetryConfig,
    /// On-demand models activated by `start` in addition to always-on ones.
    #[serde(default)]
    pub preload: Vec<String>,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub replica_scaler: Option<ReplicaScalerConfig>,
}

fn default_max_concurrent_runs() -> usize {
    2
}

fn default_gateway_timeout_secs() -> u64 {
    120
}

impl SchedulerConfig {
    pub fn new(total_budget: u64) -> Self {
        Self {
            total_budget,
            max_concurrent_runs: default_max_concurrent_runs(),
            gateway_timeout_secs: default_gateway_timeout_secs(),
            queue_timeout_secs: None,
            finished_retention_secs: None,
            activation_retry: RetryConfig::default(),
            preload: Vec::new(),
            models: Vec::new(),
            replica_scaler: None,
        }
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Report<ConfigError>> {
        let path = path.as_ref();
        let config: Self = loader::load_config(path)
            .map_err(Report::new)
            .attach(format!("loading scheduler config from {}", path.display()))?;
        config
            .validate()
            .attach(format!("validating {}", path.display()))?;
        Ok(config)
    }

    /// Like [`load`](Self::load), with `{prefix}__FIELD` environment overrides.
    pub fn load_with_env(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, Report<ConfigError>> {
        let path = path.as_ref();
        let config: Self = loader::load_with_env(path, env_prefix)
            .map_err(Report::new)
            .attach(format!(
                "loading scheduler config from {} with {env_prefix} overrides",
                path.display()
            ))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_concurrent_runs(mut self, n: usize) -> Self {
        self.max_concurrent_runs = n;
        self
    }

    pub fn with_gateway_timeout_secs(mut self, secs: u64) -> Self {
        self.gateway_timeout_secs = secs;
        self
    }

    pub fn with_queue_timeout_secs(mut self, secs: u64) -> Self {
        self.queue_timeout_secs = Some(secs);
        self
    }

    pub fn with_finished_retention_secs(mut self, secs: u64) -> Self {
        self.finished_retention_secs = Some(secs);
        self
    }

    pub fn with_activation_retry(mut self, retry: RetryConfig) -> Self {
        self.activation_retry = retry;
        self
    }

    pub fn with_preload(mut self, ids: Vec<String>) -> Self {
        self.preload = ids;
        self
    }

    pub fn with_model(mut self, spec: ModelSpec) -> Self {
        self.models.push(spec);
        self
    }

    pub fn with_replica_scaler(mut self, scaler: ReplicaScalerConfig) -> Self {
        self.replica_scaler = Some(scaler);
        self
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_secs.map(Duration::from_secs)
    }

    pub fn finished_retention(&self) -> Option<Duration> {
        self.finished_retention_secs.map(Duration::from_secs)
    }

    /// Check the whole configuration.
    ///
    /// Rejects a zero budget, a zero concurrency limit, duplicate model ids,
    /// models that could never fit the budget, on-demand models without an
    /// idle timeout, always-on models that together exceed the budget, and
    /// preload entries naming unknown models.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let invalid = |msg: String| Report::new(ConfigError::Invalid(msg));

        if self.total_budget == 0 {
            return Err(invalid("total_budget must be > 0".into()));
        }
        if self.max_concurrent_runs == 0 {
            return Err(invalid("max_concurrent_runs must be >= 1".into()));
        }
        if self.gateway_timeout_secs == 0 {
            return Err(invalid("gateway_timeout_secs must be > 0".into()));
        }
        if self.finished_retention_secs == Some(0) {
            return Err(invalid("finished_retention_secs must be > 0".into()));
        }

        let mut seen = HashSet::new();
        let mut always_on_total = 0u64;
        for spec in &self.models {
            if !seen.insert(spec.id.as_str()) {
                return Err(invalid(format!("duplicate model id {:?}", spec.id)));
            }
            spec.descriptor()
                .validate()
                .map_err(|e| invalid(e.to_string()))?;
            if spec.memory_cost > self.total_budget {
                return Err(invalid(format!(
                    "model {} costs {} but total_budget is {}",
                    spec.id, spec.memory_cost, self.total_budget
                )));
            }
            if spec.tier == ModelTier::AlwaysOn {
                always_on_total = always_on_total.saturating_add(spec.memory_cost);
            }
        }
        if always_on_total > self.total_budget {
            return Err(invalid(format!(
                "always-on models need {always_on_total} but total_budget is {}",
                self.total_budget
            )));
        }

        if let Some(unknown) = self.preload.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(invalid(format!("preload names unknown model {unknown:?}")));
        }
        Ok(())
    }

    /// Descriptors in catalog order.
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.models.iter().map(ModelSpec::descriptor).collect()
    }

    pub fn registry(&self) -> Result<ModelRegistry, Report<RegistryError>> {
        ModelRegistry::from_descriptors(self.descriptors())
            .map_err(Report::new)
            .attach("building registry from scheduler config")
    }

    /// Replica scaler settings with per-model deployment names applied.
    pub fn replica_scaler_config(&self) -> Option<ReplicaScalerConfig> {
        let mut scaler = self.replica_scaler.clone()?;
        for spec in &self.models {
            if let Some(name) = &spec.deployment {
                scaler.deployments.insert(spec.id.clone(), name.clone());
            }
        }
        Some(scaler)
    }

    /// Replica scaling gateway over the whole catalog, if configured.
    pub fn replica_scaler_gateway(&self) -> GatewayResult<Option<ReplicaScalerGateway>> {
        self.replica_scaler_config()
            .map(|scaler| ReplicaScalerGateway::new(scaler, self.models.iter().map(|m| m.id.clone())))
            .transpose()
    }
}
