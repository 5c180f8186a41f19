//! Accel Testing Framework
//!
//! Mock gateways, scripted executors and polling helpers for exercising the
//! scheduler without real accelerators or an orchestration API.

pub mod executor;
pub mod gateway;

pub use executor::ScriptedExecutor;
pub use gateway::{GatewayCall, MockGateway};

use std::time::Duration;

use accel_foundation::Scheduler;
use accel_kernel::{RunId, RunRecord, RunStatus};
use tracing_subscriber::EnvFilter;

/// Route scheduler logs to the test harness. Filter with `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll until the run reaches `status`.
///
/// Panics if the run is unknown or ends in a different terminal status.
/// Meant for tests running on a paused clock, where the polling sleeps
/// advance time instantly.
pub async fn wait_for_status(scheduler: &Scheduler, run_id: &RunId, status: RunStatus) -> RunRecord {
    loop {
        let record = scheduler
            .get_run(run_id)
            .unwrap_or_else(|| panic!("run {run_id} is not registered"));
        if record.status == status {
            return record;
        }
        if record.status.is_terminal() {
            panic!(
                "run {run_id} ended as {} while waiting for {status}: {:?}",
                record.status, record.error
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the run is completed or failed.
pub async fn wait_for_terminal(scheduler: &Scheduler, run_id: &RunId) -> RunRecord {
    loop {
        if let Some(record) = scheduler.get_run(run_id) {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert the ordered list of calls a [`MockGateway`] received.
#[macro_export]
macro_rules! assert_gateway_calls {
    ($gateway:expr, [$($call:expr),* $(,)?]) => {
        let calls: Vec<String> = $gateway
            .calls()
            .await
            .iter()
            .map(|c| c.to_string())
            .collect();
        let expected: Vec<String> = vec![$($call.to_string()),*];
        assert_eq!(calls, expected, "unexpected gateway calls");
    };
}
