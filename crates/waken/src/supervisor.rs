//! The `supervise` command: keep a `watch` child alive.
//!
//! The child is restarted when it exits or when its heartbeat goes stale.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::{IntoDiagnostic, Result};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use waken_scheduler::heartbeat;
use waken_store::StateLayout;

/// Longest pause between restarts of a crash-looping child.
const MAX_RESTART_DELAY_SECS: u64 = 60;

pub struct SupervisorConfig {
    pub state_root: PathBuf,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    /// Arguments for the child, starting with `watch`.
    pub child_args: Vec<OsString>,
}

enum ChildExit {
    Exited(ExitStatus),
    Stalled,
    Shutdown,
}

/// Whether a child started at `started_at` has gone quiet for longer than
/// `stale_after`. Heartbeats older than the child's start do not count.
fn heartbeat_is_stale(
    last: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> bool {
    let reference = last.map_or(started_at, |at| at.max(started_at));
    heartbeat::is_stale(Some(reference), now, stale_after)
}

/// Pause before the next restart after `restarts` quick failures in a row.
fn restart_delay(restarts: u32) -> Duration {
    let secs = 1u64
        .checked_shl(restarts.min(16))
        .unwrap_or(MAX_RESTART_DELAY_SECS);
    Duration::from_secs(secs.min(MAX_RESTART_DELAY_SECS))
}

pub async fn run(config: SupervisorConfig) -> Result<()> {
    let layout = StateLayout::new(&config.state_root);
    let stale_after = chrono::Duration::from_std(config.stale_after).into_diagnostic()?;
    info!(
        root = %config.state_root.display(),
        stale_after_secs = config.stale_after.as_secs(),
        "starting supervisor"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        crate::daemon::wait_for_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let program = std::env::current_exe().into_diagnostic()?;
    let mut restarts: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let mut child = Command::new(&program)
            .args(&config.child_args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| miette::miette!("failed to start watchdog child: {}", e))?;
        let started_at = Utc::now();
        info!(pid = child.id(), "watchdog child started");

        let exit = watch_child(
            &mut child,
            &layout,
            started_at,
            config.poll_interval,
            stale_after,
            &mut shutdown_rx,
        )
        .await?;

        match exit {
            ChildExit::Shutdown => {
                stop(&mut child).await;
                break;
            }
            ChildExit::Exited(status) => {
                warn!(%status, "watchdog child exited");
            }
            ChildExit::Stalled => {
                error!(stale_after_secs = config.stale_after.as_secs(), "watchdog heartbeat is stale, restarting child");
                stop(&mut child).await;
            }
        }

        // A child that ran for a while was healthy; start the backoff over.
        if Utc::now() - started_at > stale_after {
            restarts = 0;
        } else {
            restarts = restarts.saturating_add(1);
        }
        let delay = restart_delay(restarts);
        info!(delay_secs = delay.as_secs(), restarts, "restarting watchdog child");

        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = sleep(delay) => {}
        }
    }

    info!("supervisor shut down gracefully");
    Ok(())
}

async fn watch_child(
    child: &mut Child,
    layout: &StateLayout,
    started_at: DateTime<Utc>,
    poll_interval: Duration,
    stale_after: chrono::Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<ChildExit> {
    loop {
        tokio::select! {
            status = child.wait() => {
                return Ok(ChildExit::Exited(status.into_diagnostic()?));
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(ChildExit::Shutdown);
                }
            }
            _ = sleep(poll_interval) => {
                let last = match heartbeat::read(layout) {
                    Ok(last) => last,
                    Err(e) => {
                        warn!(error = %e, "failed to read heartbeat");
                        None
                    }
                };
                if heartbeat_is_stale(last, started_at, Utc::now(), stale_after) {
                    return Ok(ChildExit::Stalled);
                }
            }
        }
    }
}

async fn stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill watchdog child");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap watchdog child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fresh_child_gets_grace_period() {
        let window = chrono::Duration::seconds(120);
        // No heartbeat yet, but the child just started.
        assert!(!heartbeat_is_stale(None, at(0), at(60), window));
        assert!(heartbeat_is_stale(None, at(0), at(121), window));
    }

    #[test]
    fn test_old_heartbeat_does_not_count_against_new_child() {
        let window = chrono::Duration::seconds(120);
        assert!(!heartbeat_is_stale(Some(at(-1000)), at(0), at(100), window));
    }

    #[test]
    fn test_recent_heartbeat_keeps_child_alive() {
        let window = chrono::Duration::seconds(120);
        assert!(!heartbeat_is_stale(Some(at(500)), at(0), at(600), window));
        assert!(heartbeat_is_stale(Some(at(500)), at(0), at(621), window));
    }

    #[test]
    fn test_restart_delay_grows_and_caps() {
        assert_eq!(restart_delay(0), Duration::from_secs(1));
        assert_eq!(restart_delay(1), Duration::from_secs(2));
        assert_eq!(restart_delay(5), Duration::from_secs(32));
        assert_eq!(restart_delay(6), Duration::from_secs(60));
        assert_eq!(restart_delay(u32::MAX), Duration::from_secs(60));
    }
}
