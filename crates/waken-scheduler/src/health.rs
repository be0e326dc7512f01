//! Read-only status surface.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use waken_store::{CheckpointId, RecordStore, SystemStatus, WorkerRecord};

use crate::restorer::LifecycleEvent;
use crate::{RestartScheduler, ScheduleOrigin, ScheduleStatus, SchedulerError, heartbeat};

/// Snapshot of the system as seen on disk at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub next_wake_at: Option<DateTime<Utc>>,
    pub seconds_remaining: Option<i64>,
    pub schedule_active: bool,
    pub schedule_status: Option<ScheduleStatus>,
    pub schedule_origin: Option<ScheduleOrigin>,
    pub attempts: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_checkpoint_id: Option<CheckpointId>,
    pub system: SystemStatus,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_age_secs: Option<i64>,
    pub last_event: Option<LifecycleEvent>,
    pub workers: Vec<WorkerRecord>,
}

/// Builds [`HealthReport`]s. Never caches and never writes, apart from
/// [`init`](Self::init).
#[derive(Debug, Clone)]
pub struct HealthReporter {
    scheduler: Arc<RestartScheduler>,
    records: RecordStore,
}

impl HealthReporter {
    pub fn new(scheduler: Arc<RestartScheduler>, records: RecordStore) -> Self {
        Self { scheduler, records }
    }

    /// Create the status singleton if it does not exist yet.
    pub fn init(&self) -> Result<SystemStatus, SchedulerError> {
        if let Some(status) = self.records.load_status()? {
            return Ok(status);
        }
        let status = SystemStatus::default();
        self.records.save_status(&status)?;
        info!("initialised system status");
        Ok(status)
    }

    /// Current status derived from on-disk state.
    pub fn status(&self, now: DateTime<Utc>) -> Result<HealthReport, SchedulerError> {
        let schedule = self.scheduler.current()?;
        let system = self.records.load_status()?.unwrap_or_default();
        let heartbeat_at = heartbeat::read(self.records.layout())?;
        let last_event = self.records.last_event::<LifecycleEvent>()?;
        let workers = self.records.list_workers()?;

        let pending = schedule.as_ref().filter(|s| s.is_pending());
        Ok(HealthReport {
            generated_at: now,
            next_wake_at: pending.map(|s| s.scheduled_at),
            seconds_remaining: pending.map(|s| s.remaining(now).num_seconds()),
            schedule_active: pending.is_some(),
            schedule_status: schedule.as_ref().map(|s| s.status.clone()),
            schedule_origin: schedule.as_ref().map(|s| s.origin),
            attempts: schedule.as_ref().map_or(0, |s| s.attempts),
            retry_after: schedule.as_ref().and_then(|s| s.retry_after),
            last_checkpoint_id: schedule
                .as_ref()
                .map(|s| s.checkpoint_id.clone())
                .or_else(|| system.last_checkpoint_id.clone()),
            heartbeat_age_secs: heartbeat_at.map(|at| (now - at).num_seconds()),
            heartbeat_at,
            system,
            last_event,
            workers,
        })
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.schedule_status, self.next_wake_at) {
            (Some(ScheduleStatus::Failed { error }), _) => {
                writeln!(
                    f,
                    "schedule:     FAILED after {} attempts: {} (run `waken acknowledge`)",
                    self.attempts, error
                )?;
            }
            (_, Some(at)) => {
                writeln!(
                    f,
                    "schedule:     pending, wakes at {} ({}s remaining)",
                    at.to_rfc3339(),
                    self.seconds_remaining.unwrap_or(0)
                )?;
                if self.attempts > 0 {
                    writeln!(f, "attempts:     {}", self.attempts)?;
                }
                if let Some(retry) = self.retry_after {
                    writeln!(f, "retry after:  {}", retry.to_rfc3339())?;
                }
            }
            _ => writeln!(f, "schedule:     none")?,
        }

        match &self.last_checkpoint_id {
            Some(id) => writeln!(f, "checkpoint:   {}", id)?,
            None => writeln!(f, "checkpoint:   none")?,
        }
        writeln!(
            f,
            "system:       {:?}, {} sessions",
            self.system.overall_status, self.system.session_count
        )?;
        if let Some(at) = self.system.last_restore_at {
            writeln!(f, "last restore: {}", at.to_rfc3339())?;
        }
        match (self.heartbeat_at, self.heartbeat_age_secs) {
            (Some(at), Some(age)) => writeln!(f, "heartbeat:    {} ({}s ago)", at.to_rfc3339(), age)?,
            _ => writeln!(f, "heartbeat:    never")?,
        }

        writeln!(f, "workers:      {}", self.workers.len())?;
        for worker in &self.workers {
            write!(f, "  {:<20} {:?}", worker.worker_id, worker.status)?;
            if let Some(task) = &worker.current_task_ref {
                write!(f, "  task={}", task)?;
            }
            if let Some(at) = worker.restarted_at {
                write!(f, "  restarted={}", at.to_rfc3339())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
