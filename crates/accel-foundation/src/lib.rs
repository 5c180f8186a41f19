//! Accel Foundation
//!
//! Budget-constrained scheduling of accelerator-resident models on top of
//! the `accel-kernel` contracts.

// ledger module - memory budget accounting
pub mod ledger;
pub use ledger::{BudgetLedger, Reservation};

// state module - active-model records
pub mod state;
pub use state::ActiveModelRecord;

// eviction module - victim selection
pub mod eviction;
pub use eviction::{EvictionPolicy, LruEviction};

// admission module - check, evict, activate, reserve
pub mod admission;
pub use admission::{Admission, AdmissionController, Adoption, BudgetSnapshot, ModelStatus};

// idle reaper
mod reaper;

// runs module - run registry and concurrency limiter
pub mod runs;
pub use runs::{ConcurrencyLimiter, RunCounts, RunRegistry};

// retry module - activation retry policies
pub mod retry;
pub use retry::{RetryConfig, RetryPolicy, retry_with_policy};

// config module
pub mod config;
pub use config::{ModelSpec, SchedulerConfig};

// registry module - config-backed registry loader
pub mod registry;
pub use registry::ConfigRegistryLoader;

// gateway module - activation gateway implementations
pub mod gateway;
pub use gateway::{
    InProcessGateway, ModelBackend, ReplicaScalerConfig, ReplicaScalerGateway,
};

// scheduler module - the facade
pub mod scheduler;
pub use scheduler::{
    Scheduler, SchedulerBuilder, SchedulerStats, ShutdownReport, StartReport,
};
