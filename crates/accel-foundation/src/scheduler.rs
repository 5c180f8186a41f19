//! Scheduler facade.
//!
//! [`Scheduler`] composes the admission controller, the run registry and
//! the concurrency limiter. Every submission gets its own worker task that
//! queues for a slot, admits the model, executes the run and records the
//! outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! use accel_foundation::{Scheduler, SchedulerConfig};
//!
//! let config = SchedulerConfig::load("config/scheduler.example.yaml")?;
//! let scheduler = Scheduler::from_config(&config, gateway)?;
//! scheduler.start().await;
//!
//! let run_id = scheduler.submit("fcn3", run_fn(|| async { Ok(json!({"frames": 40})) }));
//! let record = scheduler.get_run(&run_id);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use accel_kernel::config::ConfigError;
use accel_kernel::{
    ActivationGateway, ModelRegistry, RunExecutor, RunFn, RunId, RunOutput, RunRecord,
    SchedulerError, SchedulerResult,
};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionController, Adoption, ModelStatus};
use crate::config::SchedulerConfig;
use crate::eviction::{EvictionPolicy, LruEviction};
use crate::retry::{RetryConfig, retry_with_policy};
use crate::runs::{ConcurrencyLimiter, RunRegistry};

// ============================================================================
// Reports
// ============================================================================

/// Budget and run counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_budget: u64,
    pub used: u64,
    pub available: u64,
    pub usage_percent: f64,
    pub active_models: usize,
    pub running_runs: usize,
    pub queued_runs: usize,
    pub completed_runs: usize,
    pub failed_runs: usize,
}

/// What [`Scheduler::start`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartReport {
    pub adoption: Adoption,
    /// Always-on and preload models activated by start.
    pub activated: Vec<String>,
    pub failed: Vec<(String, SchedulerError)>,
}

/// What [`Scheduler::shutdown`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub cancelled_runs: usize,
    pub deactivated: Vec<String>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    registry: ModelRegistry,
    gateway: Arc<dyn ActivationGateway>,
    total_budget: u64,
    max_concurrent_runs: usize,
    policy: Arc<dyn EvictionPolicy>,
    executor: Option<Arc<dyn RunExecutor>>,
    gateway_timeout: Duration,
    queue_timeout: Option<Duration>,
    retry: RetryConfig,
    preload: Vec<String>,
    finished_retention: Option<Duration>,
}

impl SchedulerBuilder {
    pub fn max_concurrent_runs(mut self, n: usize) -> Self {
        self.max_concurrent_runs = n;
        self
    }

    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Executor used by [`Scheduler::submit_run`].
    pub fn executor(mut self, executor: Arc<dyn RunExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout = timeout;
        self
    }

    pub fn queue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn activation_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn preload(mut self, ids: Vec<String>) -> Self {
        self.preload = ids;
        self
    }

    /// Drop completed and failed runs this long after they finish.
    /// Pruning happens on submission; `None` keeps every record.
    pub fn finished_retention(mut self, retention: Option<Duration>) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn build(self) -> Result<Scheduler, Report<ConfigError>> {
        let invalid = |msg: String| Report::new(ConfigError::Invalid(msg));
        if self.total_budget == 0 {
            return Err(invalid("total_budget must be > 0".into()));
        }
        if self.max_concurrent_runs == 0 {
            return Err(invalid("max_concurrent_runs must be >= 1".into()));
        }
        if self.gateway_timeout.is_zero() {
            return Err(invalid("gateway_timeout must be > 0".into()));
        }
        if self.finished_retention.is_some_and(|d| d.is_zero()) {
            return Err(invalid("finished_retention must be > 0".into()));
        }
        if let Some(d) = self
            .registry
            .iter()
            .find(|d| d.memory_cost > self.total_budget)
        {
            return Err(invalid(format!(
                "model {} costs {} but total_budget is {}",
                d.id, d.memory_cost, self.total_budget
            )));
        }
        if let Some(id) = self.preload.iter().find(|id| !self.registry.contains(id)) {
            return Err(invalid(format!("preload names unknown model {id:?}")));
        }

        let registry = Arc::new(self.registry);
        let controller = AdmissionController::new(
            Arc::clone(&registry),
            Arc::clone(&self.gateway),
            self.policy,
            self.total_budget,
            self.gateway_timeout,
        );

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                controller,
                registry,
                gateway: self.gateway,
                runs: RunRegistry::new(),
                limiter: ConcurrencyLimiter::new(self.max_concurrent_runs),
                executor: self.executor,
                retry: self.retry,
                queue_timeout: self.queue_timeout,
                gateway_timeout: self.gateway_timeout,
                preload: self.preload,
                finished_retention: self.finished_retention,
                tracker: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// Scheduler
// ============================================================================

enum Work {
    Fn(RunFn),
    Payload(serde_json::Value),
}

struct SchedulerInner {
    controller: AdmissionController,
    registry: Arc<ModelRegistry>,
    gateway: Arc<dyn ActivationGateway>,
    runs: RunRegistry,
    limiter: ConcurrencyLimiter,
    executor: Option<Arc<dyn RunExecutor>>,
    retry: RetryConfig,
    queue_timeout: Option<Duration>,
    gateway_timeout: Duration,
    preload: Vec<String>,
    finished_retention: Option<Duration>,
    tracker: TaskTracker,
    shutting_down: AtomicBool,
}

/// Budget-constrained scheduler for accelerator-resident models.
///
/// Cheaply cloneable; all clones share the same state. Submission methods
/// spawn tasks and must be called from within a tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn builder(
        registry: ModelRegistry,
        gateway: Arc<dyn ActivationGateway>,
        total_budget: u64,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            registry,
            gateway,
            total_budget,
            max_concurrent_runs: 2,
            policy: Arc::new(LruEviction),
            executor: None,
            gateway_timeout: Duration::from_secs(120),
            queue_timeout: None,
            retry: RetryConfig::default(),
            preload: Vec::new(),
            finished_retention: None,
        }
    }

    /// Builder pre-filled from a validated [`SchedulerConfig`].
    pub fn builder_from_config(
        config: &SchedulerConfig,
        gateway: Arc<dyn ActivationGateway>,
    ) -> Result<SchedulerBuilder, Report<ConfigError>> {
        config.validate()?;
        let registry = config
            .registry()
            .change_context(ConfigError::Invalid("model catalog".into()))?;
        Ok(Self::builder(registry, gateway, config.total_budget)
            .max_concurrent_runs(config.max_concurrent_runs)
            .gateway_timeout(config.gateway_timeout())
            .queue_timeout(config.queue_timeout())
            .activation_retry(config.activation_retry.clone())
            .preload(config.preload.clone())
            .finished_retention(config.finished_retention()))
    }

    pub fn from_config(
        config: &SchedulerConfig,
        gateway: Arc<dyn ActivationGateway>,
    ) -> Result<Self, Report<ConfigError>> {
        Self::builder_from_config(config, gateway)?.build()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    /// Rebuild state from the gateway, then bring up always-on and preload
    /// models. Failures are logged and reported, never fatal.
    pub async fn start(&self) -> StartReport {
        let inner = &self.inner;
        let reported =
            match tokio::time::timeout(inner.gateway_timeout, inner.gateway.active_models()).await
            {
                Ok(Ok(ids)) => ids,
                Ok(Err(err)) => {
                    warn!(gateway = inner.gateway.name(), error = %err, "could not list active models");
                    Vec::new()
                }
                Err(_) => {
                    warn!(gateway = inner.gateway.name(), "listing active models timed out");
                    Vec::new()
                }
            };

        let mut report = StartReport {
            adoption: inner.controller.adopt(&reported).await,
            ..StartReport::default()
        };

        let mut targets: Vec<String> = inner.registry.always_on().map(|d| d.id.clone()).collect();
        for id in &inner.preload {
            if !targets.contains(id) {
                targets.push(id.clone());
            }
        }

        for id in targets {
            match inner.controller.ensure_active(&id).await {
                Ok(admission) => {
                    if admission.newly_activated {
                        report.activated.push(id);
                    }
                }
                Err(err) => {
                    warn!(model_id = %id, error = %err, "startup activation failed");
                    report.failed.push((id, err));
                }
            }
        }

        info!(
            adopted = report.adoption.adopted.len(),
            activated = report.activated.len(),
            failed = report.failed.len(),
            "scheduler started"
        );
        report
    }

    /// Queue `run` on `model_id`. Admission failures surface on the record.
    pub fn submit(&self, model_id: &str, run: RunFn) -> RunId {
        self.enqueue(model_id, Work::Fn(run), CancellationToken::new())
    }

    /// Like [`submit`](Self::submit); cancelling `cancel` while the run is
    /// still queued fails it with [`SchedulerError::Cancelled`].
    pub fn submit_with_cancel(&self, model_id: &str, run: RunFn, cancel: CancellationToken) -> RunId {
        self.enqueue(model_id, Work::Fn(run), cancel.child_token())
    }

    /// Queue `payload` for the configured [`RunExecutor`].
    pub fn submit_run(&self, model_id: &str, payload: serde_json::Value) -> RunId {
        if self.inner.executor.is_none() {
            let run_id = self
                .inner
                .runs
                .insert_pending(model_id, CancellationToken::new());
            self.inner.runs.fail(
                &run_id,
                SchedulerError::execution_failed("no run executor configured"),
            );
            return run_id;
        }
        self.enqueue(model_id, Work::Payload(payload), CancellationToken::new())
    }

    /// Drop completed and failed runs that finished at least `older_than`
    /// ago. Queued and running runs are never dropped.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let pruned = self.inner.runs.prune_finished(older_than);
        if pruned > 0 {
            debug!(pruned, "finished runs pruned");
        }
        pruned
    }

    pub fn get_run(&self, run_id: &RunId) -> Option<RunRecord> {
        self.inner.runs.get(run_id)
    }

    /// Every run, oldest submission first.
    pub fn list_runs(&self) -> Vec<RunRecord> {
        self.inner.runs.list()
    }

    /// Cancel a queued run. Returns false if it already holds a slot,
    /// has finished, or is unknown.
    pub fn cancel_run(&self, run_id: &RunId) -> bool {
        let cancelled = self.inner.runs.cancel(run_id);
        if cancelled {
            debug!(run_id = %run_id, "run cancellation requested");
        }
        cancelled
    }

    /// Refresh activity of `model_id`. An inactive model stays inactive.
    pub async fn heartbeat(&self, model_id: &str) -> SchedulerResult<bool> {
        self.inner.controller.heartbeat(model_id).await
    }

    pub async fn list_models(&self) -> Vec<ModelStatus> {
        self.inner.controller.model_statuses().await
    }

    /// Administrative deactivation. Always-on and busy models are refused.
    pub async fn deactivate(&self, model_id: &str) -> SchedulerResult<()> {
        self.inner.controller.deactivate(model_id).await.map(|_| ())
    }

    /// Activate a model ahead of any run.
    pub async fn ensure_active(&self, model_id: &str) -> SchedulerResult<Admission> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        self.inner.controller.ensure_active(model_id).await
    }

    pub async fn stats(&self) -> SchedulerStats {
        let budget = self.inner.controller.budget().await;
        let counts = self.inner.runs.counts();
        SchedulerStats {
            total_budget: budget.total_budget,
            used: budget.used,
            available: budget.available,
            usage_percent: budget.usage_percent,
            active_models: budget.active_models,
            running_runs: counts.running,
            queued_runs: counts.pending,
            completed_runs: counts.completed,
            failed_runs: counts.failed,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting work, cancel queued runs, wait for running ones, then
    /// deactivate every model.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
        }
        info!("scheduler shutting down");

        let cancelled_runs = inner.runs.cancel_queued();
        inner.tracker.close();
        inner.tracker.wait().await;

        let deactivated = inner.controller.close().await;
        info!(
            cancelled_runs,
            deactivated = deactivated.len(),
            "scheduler shutdown complete"
        );
        ShutdownReport {
            cancelled_runs,
            deactivated,
        }
    }

    fn enqueue(&self, model_id: &str, work: Work, cancel: CancellationToken) -> RunId {
        let inner = &self.inner;
        if let Some(retention) = inner.finished_retention {
            self.prune_finished(retention);
        }
        let run_id = inner.runs.insert_pending(model_id, cancel.clone());
        if self.is_shutting_down() {
            inner.runs.fail(&run_id, SchedulerError::ShuttingDown);
            return run_id;
        }

        debug!(run_id = %run_id, model_id, "run submitted");
        let worker = Arc::clone(inner);
        let model_id = model_id.to_string();
        inner
            .tracker
            .spawn(async move { worker.run_worker(run_id, model_id, work, cancel).await });
        run_id
    }
}

impl SchedulerInner {
    async fn run_worker(
        self: Arc<Self>,
        run_id: RunId,
        model_id: String,
        work: Work,
        cancel: CancellationToken,
    ) {
        let permit = match self.limiter.acquire(&cancel, self.queue_timeout).await {
            Ok(permit) => permit,
            Err(err) => {
                debug!(run_id = %run_id, model_id = %model_id, error = %err, "run left the queue");
                self.runs.fail(&run_id, err);
                return;
            }
        };
        if !self.runs.claim_slot(&run_id) {
            self.runs.fail(&run_id, SchedulerError::Cancelled);
            return;
        }
        debug!(run_id = %run_id, model_id = %model_id, "slot acquired");

        let runs = &self.runs;
        let on_start = || {
            runs.mark_running(&run_id);
        };
        let admitted = retry_with_policy(&self.retry, SchedulerError::is_retryable, || {
            self.controller.begin_run(&model_id, &on_start)
        })
        .await;
        if let Err(err) = admitted {
            warn!(run_id = %run_id, model_id = %model_id, error = %err, "admission failed");
            self.runs.fail(&run_id, err);
            return;
        }

        let outcome = self.execute(&model_id, work).await;
        self.controller
            .end_run(&model_id, || match outcome {
                Ok(output) => {
                    runs.complete(&run_id, output);
                    info!(run_id = %run_id, model_id = %model_id, "run completed");
                }
                Err(err) => {
                    warn!(run_id = %run_id, model_id = %model_id, error = %err, "run failed");
                    runs.fail(&run_id, err);
                }
            })
            .await;
        drop(permit);
    }

    async fn execute(&self, model_id: &str, work: Work) -> SchedulerResult<RunOutput> {
        let task = match work {
            Work::Fn(run) => tokio::spawn(async move { run().await }),
            Work::Payload(payload) => {
                let Some(executor) = self.executor.clone() else {
                    return Err(SchedulerError::execution_failed(
                        "no run executor configured",
                    ));
                };
                let model_id = model_id.to_string();
                tokio::spawn(async move { executor.execute(&model_id, payload).await })
            }
        };

        match task.await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(reason)) => Err(SchedulerError::execution_failed(reason)),
            Err(join_err) => {
                let reason = describe_join_error(join_err);
                error!(model_id, %reason, "run task aborted");
                Err(SchedulerError::execution_failed(reason))
            }
        }
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "run task was cancelled".to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("run panicked: {message}")
}
