//! Model descriptors and the static model registry.
//!
//! A [`ModelDescriptor`] is immutable once loaded. The [`ModelRegistry`]
//! owns the full set of descriptors for the lifetime of a scheduler and
//! preserves registration order, which the scheduler uses wherever a
//! deterministic iteration order is needed (boot rebuild, listings).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::RegistryError;

/// Scheduling tier of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTier {
    /// Never evicted automatically and never reaped for idleness.
    AlwaysOn,
    /// Evictable, and deactivated after its idle timeout.
    OnDemand,
}

impl ModelTier {
    /// Whether models of this tier may be chosen as eviction victims.
    pub fn is_evictable(&self) -> bool {
        matches!(self, Self::OnDemand)
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlwaysOn => write!(f, "always-on"),
            Self::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Static description of a schedulable model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    /// Unique identifier.
    pub id: String,
    /// Scheduling tier.
    pub tier: ModelTier,
    /// Accelerator memory held while active, in ledger units.
    pub memory_cost: u64,
    /// Inactivity period after which an on-demand model is deactivated.
    pub idle_timeout: Duration,
}

impl ModelDescriptor {
    /// Describe an always-on model.
    pub fn always_on(id: impl Into<String>, memory_cost: u64) -> Self {
        Self {
            id: id.into(),
            tier: ModelTier::AlwaysOn,
            memory_cost,
            idle_timeout: Duration::ZERO,
        }
    }

    /// Describe an on-demand model.
    pub fn on_demand(id: impl Into<String>, memory_cost: u64, idle_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            tier: ModelTier::OnDemand,
            memory_cost,
            idle_timeout,
        }
    }

    /// Whether this model may be evicted to make room for another.
    pub fn is_evictable(&self) -> bool {
        self.tier.is_evictable()
    }

    /// Check the descriptor's own invariants.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidDescriptor`] when the id is empty, the
    /// memory cost is zero, or an on-demand model has a zero idle timeout.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.trim().is_empty() {
            return Err(RegistryError::invalid(&self.id, "id must not be empty"));
        }
        if self.memory_cost == 0 {
            return Err(RegistryError::invalid(&self.id, "memory_cost must be > 0"));
        }
        if self.tier == ModelTier::OnDemand && self.idle_timeout.is_zero() {
            return Err(RegistryError::invalid(
                &self.id,
                "on-demand models need a non-zero idle_timeout",
            ));
        }
        Ok(())
    }
}

/// The set of models a scheduler knows about.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, ModelDescriptor>,
    order: Vec<String>,
}

impl ModelRegistry {
    /// Build a registry, validating every descriptor and rejecting duplicates.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidDescriptor`] for a descriptor that fails
    ///   [`ModelDescriptor::validate`].
    /// - [`RegistryError::DuplicateModel`] when two descriptors share an id.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ModelDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for descriptor in descriptors {
            descriptor.validate()?;
            if registry.models.contains_key(&descriptor.id) {
                return Err(RegistryError::DuplicateModel(descriptor.id));
            }
            tracing::debug!(
                model_id = %descriptor.id,
                tier = %descriptor.tier,
                memory_cost = descriptor.memory_cost,
                "registered model"
            );
            registry.order.push(descriptor.id.clone());
            registry.models.insert(descriptor.id.clone(), descriptor);
        }
        Ok(registry)
    }

    /// Look up a descriptor by id.
    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.get(model_id)
    }

    /// Whether the id is registered.
    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no models are registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Iterate descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.order.iter().filter_map(|id| self.models.get(id))
    }

    /// Iterate the always-on descriptors in registration order.
    pub fn always_on(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.iter().filter(|d| d.tier == ModelTier::AlwaysOn)
    }

    /// Largest memory cost of any registered model.
    pub fn max_memory_cost(&self) -> u64 {
        self.models.values().map(|d| d.memory_cost).max().unwrap_or(0)
    }
}
