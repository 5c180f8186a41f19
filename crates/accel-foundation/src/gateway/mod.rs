//! Activation gateway implementations.
//!
//! - [`ReplicaScalerGateway`] scales an orchestrated deployment between one
//!   and zero replicas.
//! - [`InProcessGateway`] loads and unloads weights held by in-process
//!   [`ModelBackend`]s, and can execute payload runs on them.

pub mod in_process;
pub mod replica;

pub use in_process::{BackendError, InProcessGateway, ModelBackend};
pub use replica::{ReplicaScalerConfig, ReplicaScalerGateway};
