//! Registry loader contract.
//!
//! A [`RegistryLoader`] produces the descriptors a scheduler is built from.
//! Loading errors travel as [`error_stack::Report`]s so callers can attach
//! the source (file path, inline list) as context.

use error_stack::Report;
use thiserror::Error;

use crate::model::{ModelDescriptor, ModelRegistry};

/// Errors raised while building a model registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("duplicate model id: {0}")]
    DuplicateModel(String),

    #[error("invalid descriptor for {model_id:?}: {reason}")]
    InvalidDescriptor { model_id: String, reason: String },

    #[error("failed to load model descriptors: {0}")]
    Load(String),
}

impl RegistryError {
    pub fn invalid(model_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            model_id: model_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for registry loading.
pub type RegistryResult<T> = Result<T, Report<RegistryError>>;

/// Source of model descriptors.
pub trait RegistryLoader: Send + Sync {
    /// Produce every descriptor, in registration order.
    fn load(&self) -> RegistryResult<Vec<ModelDescriptor>>;

    /// Load and validate into a [`ModelRegistry`].
    fn load_registry(&self) -> RegistryResult<ModelRegistry> {
        let descriptors = self.load()?;
        ModelRegistry::from_descriptors(descriptors).map_err(Report::new)
    }
}

/// Loader over a fixed, in-memory list.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistryLoader {
    descriptors: Vec<ModelDescriptor>,
}

impl StaticRegistryLoader {
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn with_model(mut self, descriptor: ModelDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

impl RegistryLoader for StaticRegistryLoader {
    fn load(&self) -> RegistryResult<Vec<ModelDescriptor>> {
        Ok(self.descriptors.clone())
    }
}
