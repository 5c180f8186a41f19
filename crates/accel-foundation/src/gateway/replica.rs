//! Replica scaling gateway.
//!
//! Activates a model by scaling its deployment to one replica and
//! deactivates it by scaling to zero, through the orchestration API's
//! `apps/v1` deployment resource with a JSON merge patch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use accel_kernel::{ActivationGateway, GatewayError, GatewayResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// Connection settings for [`ReplicaScalerGateway`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaScalerConfig {
    /// Base URL of the orchestration API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Deployment name is `{deployment_prefix}{model_id}` unless overridden.
    #[serde(default)]
    pub deployment_prefix: String,
    /// Per-model deployment names.
    #[serde(default)]
    pub deployments: HashMap<String, String>,
    /// File holding the bearer token, read on every request.
    #[serde(default = "default_token_path")]
    pub token_path: Option<PathBuf>,
    /// Environment variable consulted when the token file is unreadable.
    #[serde(default = "default_token_env")]
    pub token_env: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_token_path() -> Option<PathBuf> {
    Some(PathBuf::from(
        "/var/run/secrets/kubernetes.io/serviceaccount/token",
    ))
}

fn default_token_env() -> Option<String> {
    Some("K8S_TOKEN".to_string())
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ReplicaScalerConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            namespace: default_namespace(),
            deployment_prefix: String::new(),
            deployments: HashMap::new(),
            token_path: default_token_path(),
            token_env: default_token_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ReplicaScalerConfig {
    pub fn new(api_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_deployment_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.deployment_prefix = prefix.into();
        self
    }

    pub fn with_deployment(mut self, model_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.deployments.insert(model_id.into(), name.into());
        self
    }

    pub fn with_token_path(mut self, path: Option<PathBuf>) -> Self {
        self.token_path = path;
        self
    }

    pub fn with_token_env(mut self, var: Option<String>) -> Self {
        self.token_env = var;
        self
    }

    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Deployment backing `model_id`.
    pub fn deployment_name(&self, model_id: &str) -> String {
        self.deployments
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| format!("{}{}", self.deployment_prefix, model_id))
    }
}

/// Scales one deployment per model between zero and one replica.
pub struct ReplicaScalerGateway {
    client: reqwest::Client,
    config: ReplicaScalerConfig,
    /// Models probed by `active_models`.
    models: Vec<String>,
}

impl ReplicaScalerGateway {
    /// Build the gateway for the given model ids.
    pub fn new(
        config: ReplicaScalerConfig,
        models: impl IntoIterator<Item = String>,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            config,
            models: models.into_iter().collect(),
        })
    }

    pub fn config(&self) -> &ReplicaScalerConfig {
        &self.config
    }

    fn deployment_url(&self, model_id: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.namespace,
            self.config.deployment_name(model_id)
        )
    }

    async fn bearer_token(&self) -> Option<String> {
        if let Some(path) = &self.config.token_path {
            match tokio::fs::read_to_string(path).await {
                Ok(token) if !token.trim().is_empty() => return Some(token.trim().to_string()),
                Ok(_) => {}
                Err(err) => debug!(path = %path.display(), error = %err, "token file unreadable"),
            }
        }
        self.config
            .token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|token| !token.is_empty())
    }

    fn transport_error(&self, op: &str, model_id: &str, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(
                format!("{op} {model_id}"),
                Duration::from_secs(self.config.request_timeout_secs),
            )
        } else {
            GatewayError::Transport(err.to_string())
        }
    }

    async fn scale(&self, model_id: &str, replicas: u32) -> GatewayResult<()> {
        let body = json!({ "spec": { "replicas": replicas } });
        let mut request = self
            .client
            .patch(self.deployment_url(model_id))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string());
        if let Some(token) = self.bearer_token().await {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error("scale", model_id, e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                model_id: model_id.to_string(),
                reason: format!("{status}: {detail}"),
            });
        }

        info!(
            model_id,
            deployment = %self.config.deployment_name(model_id),
            replicas,
            "deployment scaled"
        );
        Ok(())
    }

    /// Desired replica count, or `None` if the deployment does not exist.
    async fn replicas(&self, model_id: &str) -> GatewayResult<Option<u64>> {
        let mut request = self.client.get(self.deployment_url(model_id));
        if let Some(token) = self.bearer_token().await {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error("status", model_id, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| GatewayError::Transport(e.to_string()))?;
                Ok(Some(body["spec"]["replicas"].as_u64().unwrap_or(0)))
            }
            status => Err(GatewayError::Rejected {
                model_id: model_id.to_string(),
                reason: status.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ActivationGateway for ReplicaScalerGateway {
    fn name(&self) -> &str {
        "replica-scaler"
    }

    async fn activate(&self, model_id: &str) -> GatewayResult<()> {
        self.scale(model_id, 1).await
    }

    async fn deactivate(&self, model_id: &str) -> GatewayResult<()> {
        self.scale(model_id, 0).await
    }

    async fn active_models(&self) -> GatewayResult<Vec<String>> {
        let mut active = Vec::new();
        for model_id in &self.models {
            match self.replicas(model_id).await? {
                Some(n) if n > 0 => active.push(model_id.clone()),
                Some(_) => {}
                None => warn!(
                    model_id = %model_id,
                    deployment = %self.config.deployment_name(model_id),
                    "deployment not found"
                ),
            }
        }
        Ok(active)
    }
}
