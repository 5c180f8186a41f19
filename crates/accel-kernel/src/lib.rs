//! Accel Kernel
//!
//! Contracts shared by every part of the accelerator model scheduler:
//!
//! - **Model descriptors** (`model`): tiers, memory costs and idle timeouts
//! - **Activation gateway** (`gateway`): the capability that physically
//!   activates or deactivates a model
//! - **Run records** (`run`): the lifecycle of one inference execution
//! - **Executors** (`executor`): how a run payload is turned into output
//! - **Errors** (`error`): the scheduler error taxonomy
//! - **Registry loaders** (`registry`): where descriptors come from
//! - **Config** (`config`): multi-format configuration loading
//!
//! Concrete implementations live in `accel-foundation`; the kernel never
//! depends on it.

// model module
pub mod model;
pub use model::{ModelDescriptor, ModelRegistry, ModelTier};

// gateway module
pub mod gateway;
pub use gateway::{ActivationGateway, GatewayError, GatewayResult};

// executor module
pub mod executor;
pub use executor::{RunExecutor, RunFn, RunFuture, RunOutput, run_fn};

// run module
pub mod run;
pub use run::{RunId, RunRecord, RunStatus};

// error module
pub mod error;
pub use error::{SchedulerError, SchedulerResult};

// registry module
pub mod registry;
pub use registry::{RegistryError, RegistryLoader, StaticRegistryLoader};

// config module
#[cfg(feature = "config")]
pub mod config;
