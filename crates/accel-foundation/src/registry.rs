//! Registry loaders backed by configuration files.

use std::path::PathBuf;

use accel_kernel::registry::RegistryResult;
use accel_kernel::{ModelDescriptor, RegistryError, RegistryLoader};
use error_stack::ResultExt;

use crate::config::SchedulerConfig;

/// Reads the `models` catalog of a scheduler configuration file.
#[derive(Debug, Clone)]
pub struct ConfigRegistryLoader {
    path: PathBuf,
}

impl ConfigRegistryLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RegistryLoader for ConfigRegistryLoader {
    fn load(&self) -> RegistryResult<Vec<ModelDescriptor>> {
        let config = SchedulerConfig::load(&self.path).change_context(RegistryError::Load(
            self.path.display().to_string(),
        ))?;
        Ok(config.descriptors())
    }
}
