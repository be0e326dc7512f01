//! Restart scheduler: the single pending restart record and its lifecycle.
//!
//! `schedule.json` only ever holds a Pending or Failed record. Terminal
//! records (triggered, cancelled, acknowledged failures) are moved to
//! `history/` so that "no file" means "no schedule".

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use waken_store::fsio::{self, is_temp_name};
use waken_store::{CheckpointId, LockGuard, StateLayout, StoreLock};

use crate::{ResetSchedule, RetryPolicy, ScheduleOrigin, ScheduleStatus, SchedulerError};

/// Owner of the pending restart record.
#[derive(Debug)]
pub struct RestartScheduler {
    layout: StateLayout,
    lock: StoreLock,
    retry: RetryPolicy,
}

impl RestartScheduler {
    /// Create a scheduler over `layout`.
    pub fn new(layout: StateLayout, retry: RetryPolicy) -> Self {
        let lock = StoreLock::new(layout.schedule_lock());
        Self {
            layout,
            lock,
            retry,
        }
    }

    /// The current record, if any.
    pub fn current(&self) -> Result<Option<ResetSchedule>, SchedulerError> {
        Ok(fsio::load_json(&self.layout.schedule_file())?)
    }

    /// Checkpoint referenced by the current Pending or Failed record.
    ///
    /// Pruning must never remove it.
    pub fn pending_checkpoint(&self) -> Result<Option<CheckpointId>, SchedulerError> {
        Ok(self.current()?.map(|s| s.checkpoint_id))
    }

    /// Persist a new pending schedule for an existing checkpoint.
    ///
    /// Fails with [`SchedulerError::Conflict`] if a record already exists,
    /// unless `allow_override` is set, in which case the existing record is
    /// archived first.
    #[tracing::instrument(skip(self, source_text))]
    pub fn schedule(
        &self,
        wake_at: DateTime<Utc>,
        checkpoint_id: CheckpointId,
        source_text: &str,
        now: DateTime<Utc>,
        allow_override: bool,
    ) -> Result<ResetSchedule, SchedulerError> {
        self.schedule_with(
            wake_at,
            source_text,
            now,
            allow_override,
            ScheduleOrigin::Signal,
            || Ok(checkpoint_id),
        )
    }

    /// Like [`schedule`](Self::schedule), but the checkpoint is produced by
    /// `make_checkpoint`, which only runs once the conflict check passed.
    /// The whole sequence holds the scheduler lock.
    pub fn schedule_with<F>(
        &self,
        wake_at: DateTime<Utc>,
        source_text: &str,
        now: DateTime<Utc>,
        allow_override: bool,
        origin: ScheduleOrigin,
        make_checkpoint: F,
    ) -> Result<ResetSchedule, SchedulerError>
    where
        F: FnOnce() -> Result<CheckpointId, SchedulerError>,
    {
        let guard = self.lock.acquire()?;

        if let Some(existing) = self.current()? {
            if !allow_override {
                warn!(
                    scheduled_at = %existing.scheduled_at,
                    status = %existing.status,
                    "refusing to replace existing restart record"
                );
                return Err(SchedulerError::Conflict {
                    existing: Box::new(existing),
                });
            }
            let status = if existing.is_pending() {
                ScheduleStatus::Cancelled
            } else {
                existing.status.clone()
            };
            info!(scheduled_at = %existing.scheduled_at, "overriding existing restart record");
            self.archive(&guard, existing, status, now)?;
        }

        let checkpoint_id = make_checkpoint()?;
        let schedule = ResetSchedule::new(wake_at, source_text, now, checkpoint_id)
            .with_origin(origin);
        fsio::save_json(&self.layout.schedule_file(), &schedule)?;

        info!(
            scheduled_at = %schedule.scheduled_at,
            checkpoint = %schedule.checkpoint_id,
            origin = ?schedule.origin,
            "restart scheduled"
        );
        Ok(schedule)
    }

    /// Cancel the pending record. A no-op when nothing is pending.
    pub fn cancel(&self, now: DateTime<Utc>) -> Result<Option<ResetSchedule>, SchedulerError> {
        let guard = self.lock.acquire()?;
        match self.current()? {
            Some(schedule) if schedule.is_pending() => {
                let archived = self.archive(&guard, schedule, ScheduleStatus::Cancelled, now)?;
                info!(scheduled_at = %archived.scheduled_at, "restart cancelled");
                Ok(Some(archived))
            }
            _ => Ok(None),
        }
    }

    /// Archive the record as triggered after a successful restore of
    /// `checkpoint_id`. Records for other checkpoints are left alone.
    pub fn mark_triggered(
        &self,
        checkpoint_id: &CheckpointId,
        now: DateTime<Utc>,
    ) -> Result<Option<ResetSchedule>, SchedulerError> {
        let guard = self.lock.acquire()?;
        match self.current()? {
            Some(schedule) if schedule.checkpoint_id == *checkpoint_id => {
                let archived = self.archive(&guard, schedule, ScheduleStatus::Triggered, now)?;
                info!(checkpoint = %checkpoint_id, "restart record cleared");
                Ok(Some(archived))
            }
            _ => Ok(None),
        }
    }

    /// Record a failed restore attempt. After `max_attempts` the record
    /// becomes Failed and stays in place until acknowledged.
    pub fn record_failure(
        &self,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ResetSchedule>, SchedulerError> {
        let _guard = self.lock.acquire()?;
        let Some(mut schedule) = self.current()? else {
            return Ok(None);
        };
        if !schedule.is_pending() {
            return Ok(Some(schedule));
        }

        schedule.attempts += 1;
        if schedule.attempts >= self.retry.max_attempts {
            schedule.status = ScheduleStatus::Failed {
                error: error_message.to_string(),
            };
            schedule.retry_after = None;
            schedule.resolved_at = Some(now);
            error!(
                attempts = schedule.attempts,
                checkpoint = %schedule.checkpoint_id,
                error = error_message,
                "restore failed permanently; operator action required"
            );
        } else {
            let retry_at = now + self.retry.delay_for(schedule.attempts);
            schedule.retry_after = Some(retry_at);
            warn!(
                attempts = schedule.attempts,
                max_attempts = self.retry.max_attempts,
                retry_at = %retry_at,
                error = error_message,
                "restore failed, will retry"
            );
        }
        fsio::save_json(&self.layout.schedule_file(), &schedule)?;
        Ok(Some(schedule))
    }

    /// Clear a Failed record (operator reset). A no-op otherwise.
    pub fn acknowledge_failure(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<ResetSchedule>, SchedulerError> {
        let guard = self.lock.acquire()?;
        match self.current()? {
            Some(schedule) if schedule.is_failed() => {
                let status = schedule.status.clone();
                let archived = self.archive(&guard, schedule, status, now)?;
                info!(scheduled_at = %archived.scheduled_at, "failed restart acknowledged");
                Ok(Some(archived))
            }
            _ => Ok(None),
        }
    }

    /// Archived records, oldest first.
    pub fn history(&self) -> Result<Vec<ResetSchedule>, SchedulerError> {
        let entries = match fs::read_dir(self.layout.history_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(waken_store::StoreError::from(e).into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(waken_store::StoreError::from)?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if is_temp_name(name) || !name.ends_with(".json") {
                continue;
            }
            if let Some(record) = fsio::load_json::<ResetSchedule>(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(records)
    }

    fn history_path(&self, schedule: &ResetSchedule) -> PathBuf {
        self.layout.history_dir().join(format!(
            "{}-{}-{}.json",
            schedule.detected_at.format("%Y%m%dT%H%M%S%3fZ"),
            schedule.checkpoint_id,
            schedule.status
        ))
    }

    /// Move `schedule` into history with a terminal `status`.
    ///
    /// The history copy is written before the live record is removed, so a
    /// crash in between leaves the record in place and the step is repeated.
    fn archive(
        &self,
        _guard: &LockGuard<'_>,
        mut schedule: ResetSchedule,
        status: ScheduleStatus,
        now: DateTime<Utc>,
    ) -> Result<ResetSchedule, SchedulerError> {
        schedule.status = status;
        schedule.retry_after = None;
        schedule.resolved_at.get_or_insert(now);
        fsio::save_json(&self.history_path(&schedule), &schedule)?;
        fsio::remove_if_exists(&self.layout.schedule_file())
            .map_err(waken_store::StoreError::from)?;
        fsio::sync_dir(self.layout.root());
        Ok(schedule)
    }
}
