//! Run registry and global concurrency limiter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use accel_kernel::{RunId, RunOutput, RunRecord, RunStatus, SchedulerError, SchedulerResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// RunRegistry
// ============================================================================

struct RunEntry {
    record: RunRecord,
    cancel: CancellationToken,
    /// Set once the worker holds a concurrency slot; cancellation is then
    /// ignored.
    holds_slot: bool,
    /// When the run reached a terminal status.
    finished_at: Option<Instant>,
}

/// Counts of runs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Owns every [`RunRecord`]. All mutation happens under its lock.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Pending` record whose queueing can be cancelled via `cancel`.
    pub fn insert_pending(&self, model_id: &str, cancel: CancellationToken) -> RunId {
        let run_id = RunId::new();
        self.runs.write().insert(
            run_id,
            RunEntry {
                record: RunRecord::pending(run_id, model_id),
                cancel,
                holds_slot: false,
                finished_at: None,
            },
        );
        run_id
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunRecord> {
        self.runs.read().get(run_id).map(|e| e.record.clone())
    }

    /// All runs, oldest submission first.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> =
            self.runs.read().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| {
            a.submitted_at
                .cmp(&b.submitted_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        records
    }

    /// Record that the worker obtained a slot.
    ///
    /// Returns false when the run was cancelled first; the worker must then
    /// give the slot back and fail the run.
    pub fn claim_slot(&self, run_id: &RunId) -> bool {
        let mut runs = self.runs.write();
        match runs.get_mut(run_id) {
            Some(entry) if !entry.cancel.is_cancelled() => {
                entry.holds_slot = true;
                true
            }
            _ => false,
        }
    }

    /// Request cancellation of a queued run.
    ///
    /// Returns false for unknown runs and for runs that already hold a slot
    /// or have finished.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let runs = self.runs.read();
        match runs.get(run_id) {
            Some(entry) if !entry.holds_slot && entry.record.status == RunStatus::Pending => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every run still waiting for a slot. Returns how many.
    pub fn cancel_queued(&self) -> usize {
        let runs = self.runs.read();
        runs.values()
            .filter(|e| !e.holds_slot && e.record.status == RunStatus::Pending)
            .inspect(|e| e.cancel.cancel())
            .count()
    }

    pub fn mark_running(&self, run_id: &RunId) -> bool {
        self.update(run_id, |r| r.mark_running())
    }

    pub fn complete(&self, run_id: &RunId, output: RunOutput) -> bool {
        self.finish(run_id, |r| r.complete(output))
    }

    pub fn fail(&self, run_id: &RunId, error: SchedulerError) -> bool {
        self.finish(run_id, |r| r.fail(error))
    }

    /// Drop completed and failed runs that finished at least `older_than`
    /// ago. Pending and running runs are always kept. Returns how many were
    /// dropped.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let mut runs = self.runs.write();
        let before = runs.len();
        runs.retain(|_, entry| {
            !entry
                .finished_at
                .is_some_and(|at| at.elapsed() >= older_than)
        });
        before - runs.len()
    }

    pub fn counts(&self) -> RunCounts {
        let runs = self.runs.read();
        let mut counts = RunCounts::default();
        for entry in runs.values() {
            match entry.record.status {
                RunStatus::Pending => counts.pending += 1,
                RunStatus::Running => counts.running += 1,
                RunStatus::Completed => counts.completed += 1,
                RunStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }

    fn update(&self, run_id: &RunId, f: impl FnOnce(&mut RunRecord) -> bool) -> bool {
        self.runs
            .write()
            .get_mut(run_id)
            .is_some_and(|entry| f(&mut entry.record))
    }

    fn finish(&self, run_id: &RunId, f: impl FnOnce(&mut RunRecord) -> bool) -> bool {
        let mut runs = self.runs.write();
        let Some(entry) = runs.get_mut(run_id) else {
            return false;
        };
        let finished = f(&mut entry.record);
        if finished {
            entry.finished_at = Some(Instant::now());
        }
        finished
    }
}

// ============================================================================
// ConcurrencyLimiter
// ============================================================================

/// Global bound on concurrently executing runs.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a slot.
    ///
    /// Fails with [`SchedulerError::Cancelled`] when `cancel` fires or the
    /// optional `deadline` passes first.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> SchedulerResult<OwnedSemaphorePermit> {
        let expired = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| SchedulerError::ShuttingDown)
            }
            _ = expired => Err(SchedulerError::Cancelled),
        }
    }
}
