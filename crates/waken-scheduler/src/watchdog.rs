//! The watchdog loop: polls the restart record and resumes workers when due.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use waken_store::fsio::is_temp_name;
use waken_store::{CheckpointId, StateLayout, StoreError};

use crate::{
    Orchestrator, RestoreOutcome, ScheduleOrigin, SchedulerError, WatchdogConfig, heartbeat,
};

const PROCESSED_DIR: &str = "processed";
const REJECTED_DIR: &str = "rejected";

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No restart record.
    Idle,
    /// A record exists but is not due yet.
    Waiting { remaining_secs: i64 },
    /// A previous attempt failed; waiting for the backoff to pass.
    BackingOff { retry_after: DateTime<Utc> },
    /// The fixed-cycle fallback scheduled a resumption.
    CycleScheduled { checkpoint_id: CheckpointId },
    /// The checkpoint was restored and the record archived.
    Restored(RestoreOutcome),
    /// The restore failed and will be retried.
    RetryScheduled {
        attempts: u32,
        retry_after: Option<DateTime<Utc>>,
    },
    /// The restore failed for the last time; the record is now Failed.
    Failed { error: String },
    /// The record is Failed and waits for an operator.
    Halted,
}

/// Drives ticks against one [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct Watchdog {
    orchestrator: Arc<Orchestrator>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(orchestrator: Arc<Orchestrator>, config: WatchdogConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Run one tick at `now`.
    #[tracing::instrument(skip(self))]
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome, SchedulerError> {
        heartbeat::write(self.orchestrator.layout(), now)?;

        if self.config.inbox_enabled {
            self.process_inbox(now)?;
        }

        let scheduler = self.orchestrator.scheduler();
        let Some(schedule) = scheduler.current()? else {
            return match self.fixed_cycle(now)? {
                Some(checkpoint_id) => Ok(TickOutcome::CycleScheduled { checkpoint_id }),
                None => Ok(TickOutcome::Idle),
            };
        };

        if schedule.is_failed() {
            error!(
                scheduled_at = %schedule.scheduled_at,
                attempts = schedule.attempts,
                status = ?schedule.status,
                "restart record failed; run `waken acknowledge` or `waken force-restore`"
            );
            return Ok(TickOutcome::Halted);
        }

        if now < schedule.scheduled_at {
            let remaining_secs = schedule.remaining(now).num_seconds();
            info!(remaining_secs, wake_at = %schedule.scheduled_at, "waiting for reset");
            return Ok(TickOutcome::Waiting { remaining_secs });
        }

        if let Some(retry_after) = schedule.retry_after.filter(|at| now < *at) {
            debug!(%retry_after, attempts = schedule.attempts, "backing off");
            return Ok(TickOutcome::BackingOff { retry_after });
        }

        info!(checkpoint = %schedule.checkpoint_id, attempts = schedule.attempts, "reset is due, restoring");
        match self
            .orchestrator
            .restorer()
            .restore_and_resume(&schedule.checkpoint_id, now)
        {
            Ok(outcome) => {
                scheduler.mark_triggered(&schedule.checkpoint_id, now)?;
                if let Err(e) = self.orchestrator.prune(now) {
                    warn!(error = %e, "pruning after restore failed");
                }
                Ok(TickOutcome::Restored(outcome))
            }
            Err(e) => {
                let message = e.to_string();
                if e.is_restore_error() {
                    warn!(error = %message, "checkpoint could not be restored");
                } else {
                    error!(error = %message, "restore failed");
                }
                let updated = scheduler.record_failure(&message, now)?;
                match updated {
                    Some(record) if record.is_failed() => Ok(TickOutcome::Failed { error: message }),
                    Some(record) => Ok(TickOutcome::RetryScheduled {
                        attempts: record.attempts,
                        retry_after: record.retry_after,
                    }),
                    None => Ok(TickOutcome::Idle),
                }
            }
        }
    }

    /// Tick on the configured interval until `shutdown_rx` turns true.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            cycle_hours = self.config.cycle.map(|c| c.num_hours()),
            "watchdog starting"
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("watchdog received shutdown signal");
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let watchdog = self.clone();
            let tick = tokio::task::spawn_blocking(move || watchdog.tick_at(Utc::now()));
            let result = with_heartbeat(self.orchestrator.layout(), self.config.poll_interval, tick)
                .await
                .map_err(SchedulerError::from)
                .and_then(|r| r);
            match result {
                Ok(outcome) => debug!(?outcome, "tick complete"),
                Err(e) => error!(error = %e, "watchdog tick failed"),
            }
        }

        info!("watchdog shut down gracefully");
    }

    /// Schedule an immediate resumption when the fixed cycle has elapsed
    /// without any explicit signal.
    fn fixed_cycle(&self, now: DateTime<Utc>) -> Result<Option<CheckpointId>, SchedulerError> {
        let Some(cycle) = self.config.cycle else {
            return Ok(None);
        };
        let status = self.orchestrator.records().load_status()?.unwrap_or_default();
        let Some(last_restore_at) = status.last_restore_at else {
            return Ok(None);
        };
        // A cycle that ends past the representable range never comes due.
        let Some(due_at) = last_restore_at.checked_add_signed(cycle) else {
            return Ok(None);
        };
        if due_at > now {
            return Ok(None);
        }

        let window_start = now
            .checked_sub_signed(cycle)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent_signal = self
            .orchestrator
            .scheduler()
            .history()?
            .iter()
            .any(|s| s.origin == ScheduleOrigin::Signal && s.detected_at > window_start);
        if recent_signal {
            return Ok(None);
        }

        let text = format!("fixed cycle of {}h", cycle.num_hours());
        match self
            .orchestrator
            .schedule_snapshot(now, &text, now, false, ScheduleOrigin::FixedCycle)
        {
            Ok(schedule) => {
                info!(checkpoint = %schedule.checkpoint_id, %last_restore_at, "fixed-cycle fallback scheduled a resumption");
                Ok(Some(schedule.checkpoint_id))
            }
            // A signal arrived between the read and the lock; it wins.
            Err(SchedulerError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Turn every `*.txt` file in the inbox into a schedule.
    fn process_inbox(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let inbox = self.orchestrator.layout().inbox_dir();
        let entries = match fs::read_dir(&inbox) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::from(e).into()),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !is_temp_name(n) && n.ends_with(".txt"))
            })
            .collect();
        files.sort();

        for path in files {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable trigger file");
                    move_to(&inbox.join(REJECTED_DIR), &path, now)?;
                    continue;
                }
            };

            match self.orchestrator.handle_signal(&text, now, false) {
                Ok(schedule) => {
                    info!(path = %path.display(), wake_at = %schedule.scheduled_at, "scheduled from trigger file");
                    move_to(&inbox.join(PROCESSED_DIR), &path, now)?;
                }
                Err(e @ (SchedulerError::Parse(_) | SchedulerError::Conflict { .. })) => {
                    warn!(path = %path.display(), error = %e, "rejected trigger file");
                    move_to(&inbox.join(REJECTED_DIR), &path, now)?;
                }
                // Left in place and retried on the next tick.
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to process trigger file");
                }
            }
        }
        Ok(())
    }
}

/// Await `task`, refreshing the heartbeat every `every` until it finishes.
///
/// A restore of a large tree can outlast the supervisor's staleness window.
async fn with_heartbeat<T>(
    layout: &StateLayout,
    every: std::time::Duration,
    mut task: JoinHandle<T>,
) -> Result<T, JoinError> {
    loop {
        tokio::select! {
            joined = &mut task => return joined,
            _ = sleep(every) => {
                if let Err(e) = heartbeat::write(layout, Utc::now()) {
                    warn!(error = %e, "failed to refresh heartbeat");
                }
            }
        }
    }
}

fn move_to(dir: &Path, path: &Path, now: DateTime<Utc>) -> Result<(), SchedulerError> {
    fs::create_dir_all(dir).map_err(StoreError::from)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = dir.join(format!("{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), name));
    fs::rename(path, target).map_err(StoreError::from)?;
    Ok(())
}
