//! Wiring of the store, scheduler, restorer and reporter over one state root.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use waken_store::{
    Checkpoint, CheckpointId, CheckpointStore, RecordStore, StateLayout, WorkerRecord,
};

use crate::{
    HealthReport, HealthReporter, OrchestratorConfig, ResetSchedule, RestartScheduler,
    RestoreOutcome, ScheduleOrigin, SchedulerError, StateRestorer, signal,
};

/// Entry point for every operation on a state root.
#[derive(Debug)]
pub struct Orchestrator {
    layout: StateLayout,
    store: Arc<CheckpointStore>,
    records: RecordStore,
    scheduler: Arc<RestartScheduler>,
    restorer: StateRestorer,
    health: HealthReporter,
}

impl Orchestrator {
    /// Open (creating if needed) the state root at `root`.
    ///
    /// Leftover generation directories from an interrupted restore are
    /// swept, and the status singleton is created if missing.
    #[tracing::instrument(skip(root, config), fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>, config: OrchestratorConfig) -> Result<Self, SchedulerError> {
        let orchestrator = Self::build(StateLayout::new(root.as_ref()), config);
        orchestrator.layout.ensure()?;
        {
            let _guard = orchestrator.store.lock()?;
            let swept = orchestrator.layout.sweep_generations()?;
            if swept > 0 {
                info!(swept, "removed stale generation directories");
            }
        }
        orchestrator.health.init()?;
        Ok(orchestrator)
    }

    /// Open `root` for inspection only.
    ///
    /// Nothing is created, swept or locked, so this is safe to run next to a
    /// live watchdog. A missing root reads as empty state. Only the query
    /// operations ([`status`](Self::status), [`checkpoints`](Self::checkpoints))
    /// should be used on the result.
    pub fn open_read_only(root: impl AsRef<Path>, config: OrchestratorConfig) -> Self {
        Self::build(StateLayout::new(root.as_ref()), config)
    }

    fn build(layout: StateLayout, config: OrchestratorConfig) -> Self {
        let store = Arc::new(CheckpointStore::new(layout.clone(), config.retention));
        let records = RecordStore::new(layout.clone());
        let scheduler = Arc::new(RestartScheduler::new(layout.clone(), config.retry));
        let restorer = StateRestorer::new(store.clone(), records.clone());
        let health = HealthReporter::new(scheduler.clone(), records.clone());
        Self {
            layout,
            store,
            records,
            scheduler,
            restorer,
            health,
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn scheduler(&self) -> &RestartScheduler {
        &self.scheduler
    }

    pub fn restorer(&self) -> &StateRestorer {
        &self.restorer
    }

    /// Parse a reset announcement, snapshot the live tree and schedule the
    /// restart. Nothing is written if parsing fails or the schedule
    /// conflicts.
    #[tracing::instrument(skip(self, text))]
    pub fn handle_signal(
        &self,
        text: &str,
        now: DateTime<Utc>,
        allow_override: bool,
    ) -> Result<ResetSchedule, SchedulerError> {
        let wake_at = signal::parse_at(text, now)?;
        info!(%wake_at, "parsed reset signal");
        self.schedule_snapshot(wake_at, text, now, allow_override, ScheduleOrigin::Signal)
    }

    /// Snapshot the live tree and schedule a restart of it at `wake_at`.
    pub fn schedule_snapshot(
        &self,
        wake_at: DateTime<Utc>,
        source_text: &str,
        now: DateTime<Utc>,
        allow_override: bool,
        origin: ScheduleOrigin,
    ) -> Result<ResetSchedule, SchedulerError> {
        let reason = match origin {
            ScheduleOrigin::Signal => "reset signal",
            ScheduleOrigin::FixedCycle => "fixed cycle",
        };
        self.scheduler
            .schedule_with(wake_at, source_text, now, allow_override, origin, || {
                let guard = self.store.lock()?;
                Ok(self.store.snapshot_locked(&guard, reason, now)?.id)
            })
    }

    /// Take a checkpoint outside of any schedule.
    pub fn snapshot(&self, reason: &str, now: DateTime<Utc>) -> Result<Checkpoint, SchedulerError> {
        let guard = self.store.lock()?;
        Ok(self.store.snapshot_locked(&guard, reason, now)?)
    }

    /// Cancel the pending restart. Idempotent.
    pub fn cancel(&self, now: DateTime<Utc>) -> Result<Option<ResetSchedule>, SchedulerError> {
        self.scheduler.cancel(now)
    }

    /// Clear a Failed restart record.
    pub fn acknowledge(&self, now: DateTime<Utc>) -> Result<Option<ResetSchedule>, SchedulerError> {
        self.scheduler.acknowledge_failure(now)
    }

    /// Manually restore `checkpoint_id`, or the newest complete checkpoint.
    ///
    /// Bypasses the idempotency guard. A Pending or Failed record for the
    /// same checkpoint is resolved as triggered.
    #[tracing::instrument(skip(self))]
    pub fn force_restore(
        &self,
        checkpoint_id: Option<CheckpointId>,
        now: DateTime<Utc>,
    ) -> Result<RestoreOutcome, SchedulerError> {
        let id = match checkpoint_id {
            Some(id) => id,
            None => self
                .store
                .most_recent_complete()?
                .map(|c| c.id)
                .ok_or(SchedulerError::NoCheckpoint)?,
        };
        let outcome = self.restorer.force_restore(&id, now)?;
        self.scheduler.mark_triggered(&id, now)?;
        Ok(outcome)
    }

    /// Apply the retention policy. The checkpoint of a live record is kept.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<Vec<CheckpointId>, SchedulerError> {
        let protected: Vec<_> = self.scheduler.pending_checkpoint()?.into_iter().collect();
        let removed = self.store.prune(&protected, now)?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned checkpoints");
        }
        Ok(removed)
    }

    /// All checkpoints, oldest first.
    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>, SchedulerError> {
        Ok(self.store.list()?)
    }

    /// Create or refresh a worker record.
    ///
    /// Worker records live in the live tree, so the update runs under the
    /// store lock and cannot interleave with a snapshot or a restore.
    pub fn register_worker(
        &self,
        worker_id: &str,
        task_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, SchedulerError> {
        let _guard = self.store.lock()?;
        Ok(self.records.register_worker(worker_id, task_ref, now)?)
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<HealthReport, SchedulerError> {
        self.health.status(now)
    }
}
