//! Run execution contract.
//!
//! A run is either an arbitrary closure ([`RunFn`]) handed to the scheduler,
//! or a JSON payload interpreted by a configured [`RunExecutor`].

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Output recorded on a completed run.
pub type RunOutput = serde_json::Value;

/// Future produced by a run function. An `Err` marks the run failed.
pub type RunFuture = BoxFuture<'static, Result<RunOutput, String>>;

/// One-shot run function, invoked once the model is active and a slot is held.
pub type RunFn = Box<dyn FnOnce() -> RunFuture + Send + 'static>;

/// Executes payload-based runs against an active model.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(
        &self,
        model_id: &str,
        payload: serde_json::Value,
    ) -> Result<RunOutput, String>;
}

/// Box an async closure as a [`RunFn`].
///
/// ```rust,ignore
/// let run = accel_kernel::executor::run_fn(|| async { Ok(serde_json::json!({"ok": true})) });
/// ```
pub fn run_fn<F, Fut>(f: F) -> RunFn
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<RunOutput, String>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}
