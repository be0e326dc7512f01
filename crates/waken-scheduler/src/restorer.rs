//! State restorer: swap a checkpoint back in and resume every worker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use waken_store::{
    CheckpointId, CheckpointStore, LockGuard, OverallStatus, RecordStore, SystemStatus,
};

use crate::SchedulerError;

/// Entry in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A restore finished and workers were resumed.
    RestoreCompleted {
        checkpoint_id: CheckpointId,
        at: DateTime<Utc>,
        workers: usize,
        #[serde(default)]
        forced: bool,
    },
}

/// Result of a restore request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The checkpoint was swapped in and workers resumed.
    Restored {
        checkpoint_id: CheckpointId,
        workers: usize,
        session_count: u64,
    },
    /// A restore at or after this checkpoint already happened.
    AlreadyApplied {
        checkpoint_id: CheckpointId,
        last_restore_at: DateTime<Utc>,
    },
}

impl RestoreOutcome {
    pub fn checkpoint_id(&self) -> &CheckpointId {
        match self {
            RestoreOutcome::Restored { checkpoint_id, .. }
            | RestoreOutcome::AlreadyApplied { checkpoint_id, .. } => checkpoint_id,
        }
    }
}

/// Performs the restore pipeline under the checkpoint store lock.
#[derive(Debug, Clone)]
pub struct StateRestorer {
    store: Arc<CheckpointStore>,
    records: RecordStore,
}

impl StateRestorer {
    pub fn new(store: Arc<CheckpointStore>, records: RecordStore) -> Self {
        Self { store, records }
    }

    /// Restore `checkpoint_id` and resume all workers.
    ///
    /// A no-op once the last restore happened at or after the checkpoint's
    /// creation time, so re-running after a crash cannot roll workers back
    /// twice.
    #[tracing::instrument(skip(self), fields(checkpoint = %checkpoint_id))]
    pub fn restore_and_resume(
        &self,
        checkpoint_id: &CheckpointId,
        now: DateTime<Utc>,
    ) -> Result<RestoreOutcome, SchedulerError> {
        let guard = self.store.lock()?;
        let status = self.records.load_status()?.unwrap_or_default();

        if let Some(last_restore_at) = status.last_restore_at {
            if last_restore_at >= checkpoint_id.created_at() {
                info!(%last_restore_at, "checkpoint already applied, skipping restore");
                return Ok(RestoreOutcome::AlreadyApplied {
                    checkpoint_id: checkpoint_id.clone(),
                    last_restore_at,
                });
            }
        }

        self.apply(&guard, status, checkpoint_id, now, false)
    }

    /// Restore `checkpoint_id` even if it was already applied.
    #[tracing::instrument(skip(self), fields(checkpoint = %checkpoint_id))]
    pub fn force_restore(
        &self,
        checkpoint_id: &CheckpointId,
        now: DateTime<Utc>,
    ) -> Result<RestoreOutcome, SchedulerError> {
        let guard = self.store.lock()?;
        let status = self.records.load_status()?.unwrap_or_default();
        self.apply(&guard, status, checkpoint_id, now, true)
    }

    fn apply(
        &self,
        guard: &LockGuard<'_>,
        previous: SystemStatus,
        checkpoint_id: &CheckpointId,
        now: DateTime<Utc>,
        forced: bool,
    ) -> Result<RestoreOutcome, SchedulerError> {
        // Refuse early so a bad checkpoint never flips the status.
        let checkpoint = self.store.load(checkpoint_id)?;
        self.store.validate(&checkpoint)?;

        self.records.save_status(&SystemStatus {
            overall_status: OverallStatus::Restoring,
            ..previous.clone()
        })?;

        let report = match self.store.restore_locked(guard, checkpoint_id) {
            Ok(report) => report,
            Err(e) => {
                if let Err(rollback) = self.records.save_status(&previous) {
                    warn!(error = %rollback, "failed to roll back system status");
                }
                return Err(e.into());
            }
        };

        let mut workers = self.records.list_workers()?;
        for worker in &mut workers {
            worker.resume(now);
            self.records.save_worker(worker)?;
        }

        // The event goes first: saving the status closes the idempotency
        // guard, and a replayed event is harmless.
        self.records.append_event(&LifecycleEvent::RestoreCompleted {
            checkpoint_id: checkpoint_id.clone(),
            at: now,
            workers: workers.len(),
            forced,
        })?;
        let status = SystemStatus {
            overall_status: OverallStatus::Running,
            last_restore_at: Some(now),
            session_count: previous.session_count + 1,
            last_checkpoint_id: Some(checkpoint_id.clone()),
        };
        self.records.save_status(&status)?;

        info!(
            checkpoint = %checkpoint_id,
            files = report.files_restored,
            workers = workers.len(),
            session_count = status.session_count,
            forced,
            "workers resumed"
        );
        Ok(RestoreOutcome::Restored {
            checkpoint_id: checkpoint_id.clone(),
            workers: workers.len(),
            session_count: status.session_count,
        })
    }
}
