//! Eviction policy: which active models to deactivate to free capacity.

use std::collections::HashMap;

use accel_kernel::ModelRegistry;

use crate::state::ActiveModelRecord;

/// Chooses victims to free at least `required` units of budget.
pub trait EvictionPolicy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Return victims in eviction order.
    ///
    /// The list may free less than `required` when candidates run out; the
    /// caller decides what to do with a short list. Implementations must
    /// never return an always-on model or a model with running runs.
    fn select_victims(
        &self,
        required: u64,
        active: &HashMap<String, ActiveModelRecord>,
        registry: &ModelRegistry,
    ) -> Vec<String>;
}

/// Least-recently-active first, ties broken by model id.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruEviction;

impl EvictionPolicy for LruEviction {
    fn name(&self) -> &str {
        "lru"
    }

    fn select_victims(
        &self,
        required: u64,
        active: &HashMap<String, ActiveModelRecord>,
        registry: &ModelRegistry,
    ) -> Vec<String> {
        if required == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(&ActiveModelRecord, u64)> = active
            .values()
            .filter(|record| !record.is_busy())
            .filter_map(|record| {
                let descriptor = registry.get(&record.model_id)?;
                descriptor
                    .is_evictable()
                    .then_some((record, descriptor.memory_cost))
            })
            .collect();

        candidates.sort_by(|(a, _), (b, _)| {
            a.last_activity_at
                .cmp(&b.last_activity_at)
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        let mut victims = Vec::new();
        let mut freed = 0u64;
        for (record, cost) in candidates {
            if freed >= required {
                break;
            }
            victims.push(record.model_id.clone());
            freed = freed.saturating_add(cost);
        }
        victims
    }
}
