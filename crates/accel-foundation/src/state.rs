//! Shared scheduler state: the budget ledger plus the active-model set.
//!
//! Both live in one [`SchedulerState`] behind one lock so every decision that
//! reads availability and every mutation of it form a single critical
//! section.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ledger::BudgetLedger;

/// A model currently holding a ledger reservation.
#[derive(Debug)]
pub struct ActiveModelRecord {
    pub model_id: String,
    pub activated_at: Instant,
    pub activated_at_utc: DateTime<Utc>,
    pub last_activity_at: Instant,
    pub last_activity_utc: DateTime<Utc>,
    /// Runs currently executing on this model.
    pub running_runs: usize,
    /// Distinguishes successive activations of the same model id.
    pub generation: u64,
    /// Cancels the idle reaper, if one is armed.
    pub reaper: Option<CancellationToken>,
}

impl ActiveModelRecord {
    pub fn new(model_id: impl Into<String>, generation: u64) -> Self {
        let now = Instant::now();
        let now_utc = Utc::now();
        Self {
            model_id: model_id.into(),
            activated_at: now,
            activated_at_utc: now_utc,
            last_activity_at: now,
            last_activity_utc: now_utc,
            running_runs: 0,
            generation,
            reaper: None,
        }
    }

    /// Refresh `last_activity_at` to now.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
        self.last_activity_utc = Utc::now();
    }

    pub fn is_busy(&self) -> bool {
        self.running_runs > 0
    }

    /// Time since the last activity.
    pub fn idle_for(&self) -> std::time::Duration {
        Instant::now().saturating_duration_since(self.last_activity_at)
    }

    pub(crate) fn cancel_reaper(&mut self) {
        if let Some(token) = self.reaper.take() {
            token.cancel();
        }
    }
}

/// Lifetime counters per model, kept across deactivations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCounters {
    pub activations: u64,
    pub runs: u64,
}

/// Ledger and active set, guarded together.
#[derive(Debug)]
pub struct SchedulerState {
    pub ledger: BudgetLedger,
    pub active: HashMap<String, ActiveModelRecord>,
    pub counters: HashMap<String, ModelCounters>,
    /// Set once shutdown begins; no further admissions are made.
    pub closed: bool,
    next_generation: u64,
}

impl SchedulerState {
    pub fn new(total_budget: u64) -> Self {
        Self {
            ledger: BudgetLedger::new(total_budget),
            active: HashMap::new(),
            counters: HashMap::new(),
            closed: false,
            next_generation: 0,
        }
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn counters_mut(&mut self, model_id: &str) -> &mut ModelCounters {
        self.counters.entry(model_id.to_string()).or_default()
    }

    pub fn counters(&self, model_id: &str) -> ModelCounters {
        self.counters.get(model_id).copied().unwrap_or_default()
    }

    /// Sum of running runs across all active models.
    pub fn running_runs(&self) -> usize {
        self.active.values().map(|r| r.running_runs).sum()
    }
}
