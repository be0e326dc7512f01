//! End-to-end watchdog behaviour against a real state root, with injected
//! clock values.

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use waken_scheduler::{
    Orchestrator, OrchestratorConfig, RestoreOutcome, RetryPolicy, ScheduleOrigin,
    ScheduleStatus, TickOutcome, Watchdog, WatchdogConfig,
};
use waken_store::{OverallStatus, WorkerStatus};

struct Fixture {
    dir: TempDir,
    orchestrator: Arc<Orchestrator>,
    watchdog: Watchdog,
}

fn fixture(config: OrchestratorConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Arc::new(Orchestrator::open(dir.path(), config).unwrap());
    let watchdog = Watchdog::new(
        orchestrator.clone(),
        WatchdogConfig {
            inbox_enabled: false,
            ..WatchdogConfig::default()
        },
    );
    Fixture {
        dir,
        orchestrator,
        watchdog,
    }
}

fn schedule_at(f: &Fixture, wake_at: DateTime<Utc>, now: DateTime<Utc>) {
    f.orchestrator
        .schedule_snapshot(wake_at, "reset at 3pm (UTC)", now, false, ScheduleOrigin::Signal)
        .unwrap();
}

#[test]
fn end_to_end_wait_restore_then_idle() {
    let f = fixture(OrchestratorConfig::default());
    let now = Utc::now();
    f.orchestrator.register_worker("alpha", Some("t-1".into()), now).unwrap();
    f.orchestrator.register_worker("beta", None, now).unwrap();

    let wake = now + Duration::hours(1);
    schedule_at(&f, wake, now);
    let scheduled = f.orchestrator.scheduler().current().unwrap().unwrap();

    // T-60s: nothing changes.
    let before = f.orchestrator.records().list_workers().unwrap();
    assert_eq!(
        f.watchdog.tick_at(wake - Duration::seconds(60)).unwrap(),
        TickOutcome::Waiting { remaining_secs: 60 }
    );
    assert_eq!(f.orchestrator.records().list_workers().unwrap(), before);
    assert_eq!(
        f.orchestrator.scheduler().current().unwrap(),
        Some(scheduled.clone())
    );

    // T+5s: restore, resume, clear.
    let restored_at = wake + Duration::seconds(5);
    let outcome = f.watchdog.tick_at(restored_at).unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Restored(RestoreOutcome::Restored {
            checkpoint_id: scheduled.checkpoint_id.clone(),
            workers: 2,
            session_count: 1,
        })
    );
    for worker in f.orchestrator.records().list_workers().unwrap() {
        assert_eq!(worker.status, WorkerStatus::Active);
        assert_eq!(worker.restarted_at, Some(restored_at));
    }
    assert!(f.orchestrator.scheduler().current().unwrap().is_none());

    let report = f.orchestrator.status(restored_at).unwrap();
    assert_eq!(report.system.overall_status, OverallStatus::Running);
    assert_eq!(report.system.session_count, 1);
    assert!(!report.schedule_active);
    assert!(report.last_event.is_some());

    // T+65s: no-op.
    assert_eq!(
        f.watchdog.tick_at(wake + Duration::seconds(65)).unwrap(),
        TickOutcome::Idle
    );
    assert_eq!(
        f.orchestrator.records().load_status().unwrap().unwrap().session_count,
        1
    );

    let history = f.orchestrator.scheduler().history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ScheduleStatus::Triggered);
}

#[test]
fn broken_checkpoint_retries_then_fails() {
    let f = fixture(OrchestratorConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        },
        ..OrchestratorConfig::default()
    });
    let now = Utc::now();
    f.orchestrator.register_worker("alpha", None, now).unwrap();
    let wake = now + Duration::minutes(10);
    schedule_at(&f, wake, now);
    let scheduled = f.orchestrator.scheduler().current().unwrap().unwrap();

    fs::remove_file(
        f.dir
            .path()
            .join("checkpoints")
            .join(scheduled.checkpoint_id.as_str())
            .join("COMPLETE"),
    )
    .unwrap();
    let live_before = f.orchestrator.layout().live_target().unwrap();

    assert_eq!(
        f.watchdog.tick_at(wake).unwrap(),
        TickOutcome::RetryScheduled {
            attempts: 1,
            retry_after: Some(wake + Duration::seconds(30)),
        }
    );
    assert_eq!(
        f.watchdog.tick_at(wake + Duration::seconds(10)).unwrap(),
        TickOutcome::BackingOff {
            retry_after: wake + Duration::seconds(30)
        }
    );
    let TickOutcome::Failed { error } = f.watchdog.tick_at(wake + Duration::seconds(30)).unwrap()
    else {
        panic!("expected the second failure to be final");
    };
    assert!(error.contains("incomplete"), "{error}");

    // Failed is sticky and visible.
    assert_eq!(
        f.watchdog.tick_at(wake + Duration::hours(1)).unwrap(),
        TickOutcome::Halted
    );
    let report = f.orchestrator.status(wake + Duration::hours(1)).unwrap();
    assert!(matches!(
        report.schedule_status,
        Some(ScheduleStatus::Failed { .. })
    ));
    assert_eq!(report.attempts, 2);
    assert!(report.to_string().contains("FAILED"));

    // The live tree and workers were never touched.
    assert_eq!(f.orchestrator.layout().live_target().unwrap(), live_before);
    let worker = f.orchestrator.records().load_worker("alpha").unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);

    // Operator reset returns to no schedule.
    f.orchestrator.acknowledge(wake + Duration::hours(2)).unwrap();
    assert_eq!(
        f.watchdog.tick_at(wake + Duration::hours(2)).unwrap(),
        TickOutcome::Idle
    );
}

#[test]
fn crash_between_restore_and_archive_is_not_repeated() {
    let f = fixture(OrchestratorConfig::default());
    let now = Utc::now();
    f.orchestrator.register_worker("alpha", None, now).unwrap();
    let wake = now + Duration::minutes(1);
    schedule_at(&f, wake, now);
    let scheduled = f.orchestrator.scheduler().current().unwrap().unwrap();

    // The restore completed but the record was never archived.
    f.orchestrator
        .restorer()
        .restore_and_resume(&scheduled.checkpoint_id, wake)
        .unwrap();

    let outcome = f.watchdog.tick_at(wake + Duration::seconds(30)).unwrap();
    assert!(matches!(
        outcome,
        TickOutcome::Restored(RestoreOutcome::AlreadyApplied { .. })
    ));
    assert!(f.orchestrator.scheduler().current().unwrap().is_none());

    let worker = f.orchestrator.records().load_worker("alpha").unwrap().unwrap();
    assert_eq!(worker.restarted_at, Some(wake));
    assert_eq!(
        f.orchestrator.records().load_status().unwrap().unwrap().session_count,
        1
    );
}

#[test]
fn restore_reverts_live_tree_to_checkpoint() {
    let f = fixture(OrchestratorConfig::default());
    let now = Utc::now();
    f.orchestrator.register_worker("alpha", Some("before".into()), now).unwrap();
    let wake = now + Duration::minutes(1);
    schedule_at(&f, wake, now);

    // Work done after the checkpoint is rolled back by the restore.
    f.orchestrator.register_worker("alpha", Some("after".into()), now).unwrap();
    f.orchestrator.register_worker("late", None, now).unwrap();

    f.watchdog.tick_at(wake).unwrap();
    let workers = f.orchestrator.records().list_workers().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].current_task_ref.as_deref(), Some("before"));
    assert_eq!(workers[0].status, WorkerStatus::Active);
}
