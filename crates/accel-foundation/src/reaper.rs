//! Idle reaper: one timer task per active on-demand model.
//!
//! The task sleeps for the model's idle timeout, then asks the admission
//! controller whether the model has been idle long enough. The controller
//! answers under the state lock, so the idleness check and the deactivation
//! cannot be separated by a concurrent run or heartbeat.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::admission::{ReapOutcome, WeakController};

/// Start the reaper for one activation of `model_id`.
///
/// The returned token stops the task. A task whose activation has been
/// replaced (same id, new generation) exits on its next wake-up without
/// acting.
pub(crate) fn spawn(
    controller: WeakController,
    model_id: String,
    generation: u64,
    idle_timeout: Duration,
) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let mut wait = idle_timeout;
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!(model_id = %model_id, generation, "reaper cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let Some(controller) = controller.upgrade() else {
                return;
            };
            match controller
                .reap_if_idle(&model_id, generation, idle_timeout)
                .await
            {
                ReapOutcome::Rearm(next) => {
                    debug!(model_id = %model_id, wait_ms = next.as_millis() as u64, "reaper re-armed");
                    wait = next;
                }
                ReapOutcome::Evicted | ReapOutcome::Stale => return,
            }
        }
    });

    token
}
