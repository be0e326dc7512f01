//! Integration tests for the `waken` command line.
//!
//! Each test runs the real binary against its own temporary state root.

use std::path::Path;
use std::process::{Command, Output};

use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn waken(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_waken"))
        .args(args)
        .env("WAKEN_STATE_ROOT", root)
        .env("RUST_LOG", "off")
        .output()
        .expect("failed to run waken")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn status_json(root: &Path) -> serde_json::Value {
    let output = waken(root, &["status", "--json"]);
    assert_eq!(output.status.code(), Some(0));
    serde_json::from_slice(&output.stdout).expect("status --json is valid JSON")
}

#[test]
fn unparseable_text_exits_1_without_scheduling() {
    let dir = TempDir::new().unwrap();
    let output = waken(dir.path(), &["schedule", "nothing to see here"]);
    assert_eq!(output.status.code(), Some(1));

    let status = status_json(dir.path());
    assert_eq!(status["schedule_active"], false);
    assert_eq!(status["next_wake_at"], serde_json::Value::Null);
}

#[test]
fn schedule_conflict_and_override() {
    let dir = TempDir::new().unwrap();
    let first = waken(dir.path(), &["schedule", "resets 11pm (UTC)"]);
    assert_eq!(first.status.code(), Some(0), "{}", String::from_utf8_lossy(&first.stderr));
    assert!(stdout(&first).contains("restart scheduled"));

    let second = waken(dir.path(), &["schedule", "resets 10pm (UTC)"]);
    assert_eq!(second.status.code(), Some(1));

    let forced = waken(dir.path(), &["schedule", "--override", "resets 10pm (UTC)"]);
    assert_eq!(forced.status.code(), Some(0));

    let status = status_json(dir.path());
    assert_eq!(status["schedule_active"], true);
    let wake = status["next_wake_at"].as_str().unwrap();
    assert!(wake.contains("T22:00:00"), "{wake}");
}

#[test]
fn schedule_from_file() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("signal.txt");
    std::fs::write(&file, "You've hit your limit · resets 4am (Europe/Berlin)").unwrap();

    let output = waken(
        &dir.path().join("state"),
        &["schedule", "--file", file.to_str().unwrap()],
    );
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn cancel_is_idempotent() {
    let dir = TempDir::new().unwrap();
    assert_eq!(waken(dir.path(), &["cancel"]).status.code(), Some(0));

    waken(dir.path(), &["schedule", "resets 11pm (UTC)"]);
    let cancelled = waken(dir.path(), &["cancel"]);
    assert_eq!(cancelled.status.code(), Some(0));
    assert!(stdout(&cancelled).contains("cancelled"));

    let again = waken(dir.path(), &["cancel"]);
    assert_eq!(again.status.code(), Some(0));
    assert!(stdout(&again).contains("nothing pending"));
}

#[test]
fn snapshot_register_and_force_restore() {
    let dir = TempDir::new().unwrap();
    assert_eq!(
        waken(dir.path(), &["register-worker", "alpha", "--task", "t-1"])
            .status
            .code(),
        Some(0)
    );

    // Nothing to restore yet.
    assert_eq!(waken(dir.path(), &["force-restore"]).status.code(), Some(2));

    let snapshot = waken(dir.path(), &["snapshot", "manual"]);
    assert_eq!(snapshot.status.code(), Some(0));
    let id = stdout(&snapshot)
        .split_whitespace()
        .next()
        .unwrap()
        .to_string();

    let listed = stdout(&waken(dir.path(), &["checkpoints"]));
    assert!(listed.contains(&id));
    assert!(listed.contains("complete"));

    let restored = waken(dir.path(), &["force-restore", "--checkpoint", &id]);
    assert_eq!(restored.status.code(), Some(0));
    assert!(stdout(&restored).contains("resumed 1 workers"));

    let status = status_json(dir.path());
    assert_eq!(status["system"]["overall_status"], "running");
    assert_eq!(status["system"]["session_count"], 1);
    assert_eq!(status["workers"][0]["status"], "active");
}

#[test]
fn invalid_worker_id_exits_2() {
    let dir = TempDir::new().unwrap();
    let output = waken(dir.path(), &["register-worker", "../escape"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn acknowledge_and_prune_succeed_on_empty_state() {
    let dir = TempDir::new().unwrap();
    assert_eq!(waken(dir.path(), &["acknowledge"]).status.code(), Some(0));
    let pruned = waken(dir.path(), &["prune"]);
    assert_eq!(pruned.status.code(), Some(0));
    assert!(stdout(&pruned).contains("0 checkpoints removed"));
}

#[test]
fn status_and_checkpoints_do_not_create_state() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("fresh");

    let status = waken(&root, &["status", "--json"]);
    assert_eq!(status.status.code(), Some(0));
    let report: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(report["schedule_active"], false);
    assert_eq!(waken(&root, &["checkpoints"]).status.code(), Some(0));

    assert!(!root.exists());
}

#[test]
fn out_of_range_windows_are_rejected() {
    let dir = TempDir::new().unwrap();
    let too_old = waken(dir.path(), &["--max-age-days", "4294967295", "prune"]);
    assert_eq!(too_old.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&too_old.stderr).contains("max-age-days"));

    let too_long = waken(dir.path(), &["--cycle-hours", "4294967295", "status"]);
    assert_eq!(too_long.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&too_long.stderr).contains("cycle-hours"));
}
