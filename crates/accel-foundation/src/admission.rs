//! Admission controller: check, evict if needed, activate, reserve.
//!
//! Every operation that reads or changes the ledger or the active set takes
//! the single state lock and holds it through any gateway call it makes, so
//! activations and deactivations are serialized and the ledger can never be
//! over-committed by concurrent admissions.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use accel_kernel::{
    ActivationGateway, GatewayError, GatewayResult, ModelRegistry, ModelTier, SchedulerError,
    SchedulerResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::eviction::EvictionPolicy;
use crate::reaper;
use crate::state::{ActiveModelRecord, SchedulerState};

/// Successful admission of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub model_id: String,
    /// False when the model was already active.
    pub newly_activated: bool,
    /// Models deactivated to make room, in eviction order.
    pub evicted: Vec<String>,
    /// Budget left after admission.
    pub available: u64,
}

/// Result of rebuilding state from gateway-reported models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adoption {
    /// Reported models now tracked as active.
    pub adopted: Vec<String>,
    /// Reported models that did not fit and were deactivated.
    pub released: Vec<String>,
    /// Reported ids missing from the registry; left untouched.
    pub unknown: Vec<String>,
}

/// Point-in-time view of one registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub tier: ModelTier,
    pub memory_cost: u64,
    pub active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub running_runs: usize,
    /// Activations performed by this scheduler since it was built.
    pub activation_count: u64,
    /// Runs started on this model since the scheduler was built.
    pub run_count: u64,
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub total_budget: u64,
    pub used: u64,
    pub available: u64,
    pub usage_percent: f64,
    pub active_models: usize,
    pub running_runs: usize,
}

/// What an idle reaper should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReapOutcome {
    /// Sleep this long and check again.
    Rearm(Duration),
    /// The model was deactivated.
    Evicted,
    /// The timer no longer belongs to a live activation.
    Stale,
}

#[derive(Debug, Clone, Copy)]
enum GatewayOp {
    Activate,
    Deactivate,
}

impl fmt::Display for GatewayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activate => f.write_str("activate"),
            Self::Deactivate => f.write_str("deactivate"),
        }
    }
}

struct ControllerInner {
    state: Mutex<SchedulerState>,
    registry: Arc<ModelRegistry>,
    gateway: Arc<dyn ActivationGateway>,
    policy: Arc<dyn EvictionPolicy>,
    gateway_timeout: Duration,
}

/// Owns the scheduler state and every mutation of it.
///
/// Cheaply cloneable; all clones share the same state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<ControllerInner>,
}

/// Non-owning handle held by idle reapers.
#[derive(Clone)]
pub(crate) struct WeakController(Weak<ControllerInner>);

impl WeakController {
    pub(crate) fn upgrade(&self) -> Option<AdmissionController> {
        self.0.upgrade().map(|inner| AdmissionController { inner })
    }
}

impl AdmissionController {
    pub fn new(
        registry: Arc<ModelRegistry>,
        gateway: Arc<dyn ActivationGateway>,
        policy: Arc<dyn EvictionPolicy>,
        total_budget: u64,
        gateway_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                state: Mutex::new(SchedulerState::new(total_budget)),
                registry,
                gateway,
                policy,
                gateway_timeout,
            }),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub(crate) fn downgrade(&self) -> WeakController {
        WeakController(Arc::downgrade(&self.inner))
    }

    /// Make `model_id` active, evicting idle on-demand models if needed.
    ///
    /// An already-active model only has its activity refreshed.
    pub async fn ensure_active(&self, model_id: &str) -> SchedulerResult<Admission> {
        let mut state = self.inner.state.lock().await;
        self.admit_locked(&mut state, model_id).await
    }

    /// Admit `model_id` and mark one run as executing on it.
    ///
    /// `on_start` runs inside the same critical section, after admission
    /// succeeded, so the model cannot be evicted between admission and the
    /// run being recorded as started.
    pub async fn begin_run<F>(&self, model_id: &str, on_start: &F) -> SchedulerResult<Admission>
    where
        F: Fn() + Send + Sync,
    {
        let mut state = self.inner.state.lock().await;
        let admission = self.admit_locked(&mut state, model_id).await?;
        if let Some(record) = state.active.get_mut(model_id) {
            record.running_runs += 1;
            record.touch();
        }
        state.counters_mut(model_id).runs += 1;
        on_start();
        Ok(admission)
    }

    /// Clear one busy mark left by [`begin_run`](Self::begin_run).
    ///
    /// `on_end` runs inside the critical section, so a caller that observes
    /// its effect also observes the model as no longer busy.
    pub async fn end_run<F>(&self, model_id: &str, on_end: F)
    where
        F: FnOnce() + Send,
    {
        let mut state = self.inner.state.lock().await;
        on_end();
        if let Some(record) = state.active.get_mut(model_id) {
            record.running_runs = record.running_runs.saturating_sub(1);
            record.touch();
        }
    }

    /// Refresh activity of an active model.
    ///
    /// Returns `Ok(false)` for a known but inactive model; it is not
    /// activated.
    pub async fn heartbeat(&self, model_id: &str) -> SchedulerResult<bool> {
        if !self.inner.registry.contains(model_id) {
            return Err(SchedulerError::model_not_found(model_id));
        }
        let mut state = self.inner.state.lock().await;
        match state.active.get_mut(model_id) {
            Some(record) => {
                record.touch();
                debug!(model_id, "heartbeat");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deactivate a model on request.
    ///
    /// Returns `Ok(false)` when the model was not active.
    pub async fn deactivate(&self, model_id: &str) -> SchedulerResult<bool> {
        let mut state = self.inner.state.lock().await;
        self.deactivate_locked(&mut state, model_id, false).await
    }

    /// Like [`deactivate`](Self::deactivate) but also accepts always-on models.
    /// Busy models are still refused.
    pub async fn force_deactivate(&self, model_id: &str) -> SchedulerResult<bool> {
        let mut state = self.inner.state.lock().await;
        self.deactivate_locked(&mut state, model_id, true).await
    }

    /// Track models the gateway reports as already active.
    ///
    /// Reservations are made in registry order while they fit; a reported
    /// model that does not fit is deactivated through the gateway.
    pub async fn adopt(&self, reported: &[String]) -> Adoption {
        let mut adoption = Adoption::default();
        let mut state = self.inner.state.lock().await;

        for id in reported {
            if !self.inner.registry.contains(id) {
                warn!(model_id = %id, "gateway reports an unregistered model, ignoring");
                adoption.unknown.push(id.clone());
            }
        }

        let registry = Arc::clone(&self.inner.registry);
        for descriptor in registry.iter() {
            if !reported.contains(&descriptor.id) || state.active.contains_key(&descriptor.id) {
                continue;
            }
            let reservation = state.ledger.reserve(&descriptor.id, descriptor.memory_cost);
            if reservation.reserved {
                self.insert_record(&mut state, &descriptor.id, descriptor.tier, descriptor.idle_timeout);
                info!(
                    model_id = %descriptor.id,
                    available = reservation.available,
                    "adopted active model"
                );
                adoption.adopted.push(descriptor.id.clone());
            } else {
                warn!(
                    model_id = %descriptor.id,
                    memory_cost = descriptor.memory_cost,
                    available = reservation.available,
                    "reported model does not fit the budget, deactivating"
                );
                if let Err(err) = self.call_gateway(GatewayOp::Deactivate, &descriptor.id).await {
                    warn!(model_id = %descriptor.id, error = %err, "gateway deactivate failed");
                }
                adoption.released.push(descriptor.id.clone());
            }
        }
        adoption
    }

    /// Stop admitting and deactivate every model, always-on included.
    ///
    /// Returns the ids that were deactivated.
    pub async fn close(&self) -> Vec<String> {
        let mut state = self.inner.state.lock().await;
        state.closed = true;

        let registry = Arc::clone(&self.inner.registry);
        let mut deactivated = Vec::new();
        for descriptor in registry.iter() {
            if !state.active.contains_key(&descriptor.id) {
                continue;
            }
            match self.deactivate_locked(&mut state, &descriptor.id, true).await {
                Ok(_) => deactivated.push(descriptor.id.clone()),
                Err(err) => {
                    warn!(model_id = %descriptor.id, error = %err, "model left active at close");
                    if let Some(record) = state.active.get_mut(&descriptor.id) {
                        record.cancel_reaper();
                    }
                }
            }
        }
        deactivated
    }

    /// Ids of active models, in registry order.
    pub async fn active_models(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        self.inner
            .registry
            .iter()
            .filter(|d| state.active.contains_key(&d.id))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Status of every registered model, in registry order.
    pub async fn model_statuses(&self) -> Vec<ModelStatus> {
        let state = self.inner.state.lock().await;
        self.inner
            .registry
            .iter()
            .map(|d| {
                let record = state.active.get(&d.id);
                let counters = state.counters(&d.id);
                ModelStatus {
                    model_id: d.id.clone(),
                    tier: d.tier,
                    memory_cost: d.memory_cost,
                    active: record.is_some(),
                    activated_at: record.map(|r| r.activated_at_utc),
                    last_activity_at: record.map(|r| r.last_activity_utc),
                    running_runs: record.map_or(0, |r| r.running_runs),
                    activation_count: counters.activations,
                    run_count: counters.runs,
                }
            })
            .collect()
    }

    pub async fn budget(&self) -> BudgetSnapshot {
        let state = self.inner.state.lock().await;
        BudgetSnapshot {
            total_budget: state.ledger.total(),
            used: state.ledger.used(),
            available: state.ledger.available(),
            usage_percent: state.ledger.usage_percent(),
            active_models: state.active.len(),
            running_runs: state.running_runs(),
        }
    }

    /// Called by the idle reaper of `model_id` when its timer fires.
    pub(crate) async fn reap_if_idle(
        &self,
        model_id: &str,
        generation: u64,
        idle_timeout: Duration,
    ) -> ReapOutcome {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return ReapOutcome::Stale;
        }
        let Some(record) = state.active.get(model_id) else {
            return ReapOutcome::Stale;
        };
        if record.generation != generation {
            return ReapOutcome::Stale;
        }
        if record.is_busy() {
            return ReapOutcome::Rearm(idle_timeout);
        }
        let idle = record.idle_for();
        if idle < idle_timeout {
            return ReapOutcome::Rearm(idle_timeout - idle);
        }

        match self.deactivate_locked(&mut state, model_id, false).await {
            Ok(_) => {
                info!(model_id, idle_secs = idle.as_secs(), "idle model reaped");
                ReapOutcome::Evicted
            }
            Err(err) => {
                warn!(model_id, error = %err, "idle reaper could not deactivate model");
                ReapOutcome::Stale
            }
        }
    }

    async fn admit_locked(
        &self,
        state: &mut SchedulerState,
        model_id: &str,
    ) -> SchedulerResult<Admission> {
        if state.closed {
            return Err(SchedulerError::ShuttingDown);
        }
        if let Some(record) = state.active.get_mut(model_id) {
            record.touch();
            return Ok(Admission {
                model_id: model_id.to_string(),
                newly_activated: false,
                evicted: Vec::new(),
                available: state.ledger.available(),
            });
        }

        let registry = Arc::clone(&self.inner.registry);
        let descriptor = registry
            .get(model_id)
            .ok_or_else(|| SchedulerError::model_not_found(model_id))?;
        let cost = descriptor.memory_cost;

        let mut evicted = Vec::new();
        let available = state.ledger.available();
        if available < cost {
            let required = cost - available;
            let victims = self
                .inner
                .policy
                .select_victims(required, &state.active, &registry);
            let freeable: u64 = victims
                .iter()
                .filter_map(|id| registry.get(id))
                .map(|d| d.memory_cost)
                .sum();

            if freeable < required {
                warn!(
                    model_id,
                    memory_cost = cost,
                    available,
                    freeable,
                    policy = self.inner.policy.name(),
                    "insufficient budget, nothing evicted"
                );
                return Err(SchedulerError::InsufficientBudget {
                    model_id: model_id.to_string(),
                    required: cost,
                    available,
                });
            }

            for victim in victims {
                info!(model_id = %victim, requested_by = model_id, "evicting model");
                self.deactivate_locked(state, &victim, false).await?;
                evicted.push(victim);
            }

            let available = state.ledger.available();
            if available < cost {
                return Err(SchedulerError::InsufficientBudget {
                    model_id: model_id.to_string(),
                    required: cost,
                    available,
                });
            }
        }

        if let Err(err) = self.call_gateway(GatewayOp::Activate, model_id).await {
            warn!(
                model_id,
                gateway = self.inner.gateway.name(),
                error = %err,
                "activation failed"
            );
            return Err(SchedulerError::activation_failed(model_id, err));
        }

        let reservation = state.ledger.reserve(model_id, cost);
        if !reservation.reserved {
            if let Err(err) = self.call_gateway(GatewayOp::Deactivate, model_id).await {
                warn!(model_id, error = %err, "gateway deactivate failed");
            }
            return Err(SchedulerError::InsufficientBudget {
                model_id: model_id.to_string(),
                required: cost,
                available: reservation.available,
            });
        }

        self.insert_record(state, model_id, descriptor.tier, descriptor.idle_timeout);
        state.counters_mut(model_id).activations += 1;
        info!(
            model_id,
            memory_cost = cost,
            available = reservation.available,
            evicted = evicted.len(),
            "model activated"
        );

        Ok(Admission {
            model_id: model_id.to_string(),
            newly_activated: true,
            evicted,
            available: reservation.available,
        })
    }

    async fn deactivate_locked(
        &self,
        state: &mut SchedulerState,
        model_id: &str,
        force: bool,
    ) -> SchedulerResult<bool> {
        let descriptor = self
            .inner
            .registry
            .get(model_id)
            .ok_or_else(|| SchedulerError::model_not_found(model_id))?;
        let Some(record) = state.active.get(model_id) else {
            return Ok(false);
        };
        if !force && !descriptor.is_evictable() {
            return Err(SchedulerError::CannotDeactivateAlwaysOn {
                model_id: model_id.to_string(),
            });
        }
        if record.is_busy() {
            return Err(SchedulerError::ModelBusy {
                model_id: model_id.to_string(),
                running: record.running_runs,
            });
        }

        if let Err(err) = self.call_gateway(GatewayOp::Deactivate, model_id).await {
            warn!(
                model_id,
                gateway = self.inner.gateway.name(),
                error = %err,
                "gateway deactivate failed, releasing budget anyway"
            );
        }

        if let Some(mut record) = state.active.remove(model_id) {
            record.cancel_reaper();
        }
        state.ledger.release(model_id);
        info!(
            model_id,
            available = state.ledger.available(),
            "model deactivated"
        );
        Ok(true)
    }

    fn insert_record(
        &self,
        state: &mut SchedulerState,
        model_id: &str,
        tier: ModelTier,
        idle_timeout: Duration,
    ) {
        let generation = state.next_generation();
        let mut record = ActiveModelRecord::new(model_id, generation);
        if tier == ModelTier::OnDemand {
            record.reaper = Some(reaper::spawn(
                self.downgrade(),
                model_id.to_string(),
                generation,
                idle_timeout,
            ));
        }
        state.active.insert(model_id.to_string(), record);
    }

    async fn call_gateway(&self, op: GatewayOp, model_id: &str) -> GatewayResult<()> {
        let gateway = &self.inner.gateway;
        let call = match op {
            GatewayOp::Activate => gateway.activate(model_id),
            GatewayOp::Deactivate => gateway.deactivate(model_id),
        };
        match tokio::time::timeout(self.inner.gateway_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(
                format!("{op} {model_id}"),
                self.inner.gateway_timeout,
            )),
        }
    }
}
