//! waken: checkpoint a worker pool before a rate-limit reset, resume it after.
//!
//! Main binary with subcommands:
//! - `schedule`: parse a reset announcement, snapshot, schedule the restart
//! - `watch`: run the watchdog loop
//! - `supervise`: run `watch` as a child and restart it when it stalls
//! - `status`, `cancel`, `snapshot`, `force-restore`, `acknowledge`, `prune`,
//!   `checkpoints`, `register-worker`: operator commands

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waken_scheduler::{
    Orchestrator, OrchestratorConfig, RestoreOutcome, RetryPolicy, SchedulerError, WatchdogConfig,
};
use waken_store::{CheckpointId, RetentionPolicy};

mod daemon;
mod supervisor;

/// Exit code for parse failures and schedule conflicts.
const EXIT_REJECTED: u8 = 1;
/// Exit code for I/O and every other failure.
const EXIT_FAILURE: u8 = 2;

/// Upper bound for `--max-age-days` (a century).
const MAX_AGE_DAYS: i64 = 36_500;
/// Upper bound for `--cycle-hours` (a year).
const MAX_CYCLE_HOURS: i64 = 8_760;

#[derive(Parser)]
#[command(name = "waken")]
#[command(about = "Session-continuity orchestrator", long_about = None)]
struct Cli {
    /// State root directory
    #[arg(long, global = true, env = "WAKEN_STATE_ROOT")]
    state_root: Option<PathBuf>,

    /// Watchdog poll interval in seconds
    #[arg(long, global = true, env = "WAKEN_POLL_INTERVAL", default_value_t = waken_scheduler::DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval: u64,

    /// Number of most recent checkpoints always kept
    #[arg(long, global = true, env = "WAKEN_MAX_CHECKPOINTS", default_value_t = waken_store::retention::DEFAULT_MAX_COUNT)]
    max_checkpoints: usize,

    /// Days for which the newest checkpoint of each day is kept
    #[arg(
        long,
        global = true,
        env = "WAKEN_MAX_AGE_DAYS",
        default_value_t = waken_store::retention::DEFAULT_MAX_AGE_DAYS,
        value_parser = clap::value_parser!(u32).range(0..=MAX_AGE_DAYS)
    )]
    max_age_days: u32,

    /// Restore attempts before a restart record is marked failed
    #[arg(long, global = true, env = "WAKEN_MAX_ATTEMPTS", default_value_t = waken_scheduler::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,

    /// Fixed-cycle fallback period in hours (disabled when unset)
    #[arg(
        long,
        global = true,
        env = "WAKEN_CYCLE_HOURS",
        value_parser = clap::value_parser!(u32).range(1..=MAX_CYCLE_HOURS)
    )]
    cycle_hours: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a reset announcement, take a checkpoint and schedule the restart
    Schedule {
        /// Announcement text, e.g. "limit reached, resets 2:30pm (Asia/Calcutta)"
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        text: Option<String>,

        /// Read the announcement from a file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Replace an existing pending or failed record
        #[arg(long = "override")]
        allow_override: bool,
    },

    /// Show the current schedule, checkpoint and worker state
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Cancel the pending restart (no-op when nothing is pending)
    Cancel,

    /// Take a checkpoint of the live state
    Snapshot {
        /// Why the checkpoint was taken
        reason: String,
    },

    /// Restore a checkpoint now, bypassing the schedule
    ForceRestore {
        /// Checkpoint id (defaults to the newest complete checkpoint)
        #[arg(long)]
        checkpoint: Option<CheckpointId>,
    },

    /// Clear a failed restart record
    Acknowledge,

    /// Remove checkpoints outside the retention policy
    Prune,

    /// List checkpoints
    Checkpoints,

    /// Create or refresh a worker record
    RegisterWorker {
        /// Worker id
        worker_id: String,

        /// Task the worker is currently on
        #[arg(long)]
        task: Option<String>,
    },

    /// Run the watchdog loop until SIGINT/SIGTERM
    Watch,

    /// Run `watch` as a child process and restart it when its heartbeat stalls
    Supervise {
        /// Seconds without a heartbeat before the child is restarted
        /// (defaults to four poll intervals)
        #[arg(long, env = "WAKEN_HEARTBEAT_STALE_SECS")]
        heartbeat_stale_secs: Option<u64>,
    },
}

impl Cli {
    fn state_root(&self) -> Result<PathBuf> {
        match &self.state_root {
            Some(root) => Ok(root.clone()),
            None => dirs::data_dir()
                .map(|d| d.join("waken"))
                .ok_or_else(|| miette::miette!("no data directory; set WAKEN_STATE_ROOT")),
        }
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retention: RetentionPolicy {
                max_count: self.max_checkpoints,
                max_age_days: self.max_age_days,
            },
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                ..RetryPolicy::default()
            },
        }
    }

    fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            poll_interval: std::time::Duration::from_secs(self.poll_interval.max(1)),
            cycle: self
                .cycle_hours
                .and_then(|h| chrono::Duration::try_hours(i64::from(h))),
            ..WatchdogConfig::default()
        }
    }

    /// Arguments that start a `watch` child with the same settings.
    fn watch_args(&self, root: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "watch".into(),
            "--state-root".into(),
            root.into(),
            "--poll-interval".into(),
            self.poll_interval.to_string().into(),
            "--max-checkpoints".into(),
            self.max_checkpoints.to_string().into(),
            "--max-age-days".into(),
            self.max_age_days.to_string().into(),
            "--max-attempts".into(),
            self.max_attempts.to_string().into(),
        ];
        if let Some(hours) = self.cycle_hours {
            args.push("--cycle-hours".into());
            args.push(hours.to_string().into());
        }
        args
    }

    /// Open the state root for queries that must not write.
    fn open_read_only(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::open_read_only(
            self.state_root()?,
            self.orchestrator_config(),
        ))
    }

    fn open(&self) -> Result<Orchestrator> {
        let root = self.state_root()?;
        Orchestrator::open(&root, self.orchestrator_config())
            .map_err(|e| miette::miette!("failed to open state root {}: {}", root.display(), e))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "waken=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{:?}", report);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let now = Utc::now();

    match &cli.command {
        Commands::Schedule {
            text,
            file,
            allow_override,
        } => {
            let text = match (text, file) {
                (Some(text), _) => text.clone(),
                (None, Some(path)) => tokio::fs::read_to_string(path)
                    .await
                    .into_diagnostic()?,
                (None, None) => return Err(miette::miette!("no announcement text given")),
            };
            let orchestrator = cli.open()?;
            match orchestrator.handle_signal(&text, now, *allow_override) {
                Ok(schedule) => {
                    println!(
                        "restart scheduled for {} (checkpoint {})",
                        schedule.scheduled_at.to_rfc3339(),
                        schedule.checkpoint_id
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(e @ (SchedulerError::Parse(_) | SchedulerError::Conflict { .. })) => {
                    eprintln!("{:?}", miette::miette!("{}", e));
                    Ok(ExitCode::from(EXIT_REJECTED))
                }
                Err(e) => Err(miette::miette!("{}", e)),
            }
        }

        Commands::Status { json } => {
            let report = cli.open_read_only()?.status(now).map_err(|e| miette::miette!("{}", e))?;
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).into_diagnostic()?
                );
            } else {
                print!("{}", report);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Cancel => {
            match cli.open()?.cancel(now).map_err(|e| miette::miette!("{}", e))? {
                Some(schedule) => println!(
                    "cancelled restart scheduled for {}",
                    schedule.scheduled_at.to_rfc3339()
                ),
                None => println!("nothing pending"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Snapshot { reason } => {
            let checkpoint = cli
                .open()?
                .snapshot(reason, now)
                .map_err(|e| miette::miette!("snapshot failed: {}", e))?;
            println!("{} ({} files)", checkpoint.id, checkpoint.files.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::ForceRestore { checkpoint } => {
            let outcome = cli
                .open()?
                .force_restore(checkpoint.clone(), now)
                .map_err(|e| miette::miette!("restore failed: {}", e))?;
            match outcome {
                RestoreOutcome::Restored {
                    checkpoint_id,
                    workers,
                    session_count,
                } => println!(
                    "restored {} and resumed {} workers (session {})",
                    checkpoint_id, workers, session_count
                ),
                RestoreOutcome::AlreadyApplied { checkpoint_id, .. } => {
                    println!("{} already applied", checkpoint_id)
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Acknowledge => {
            match cli.open()?.acknowledge(now).map_err(|e| miette::miette!("{}", e))? {
                Some(schedule) => println!(
                    "cleared failed restart for {}",
                    schedule.scheduled_at.to_rfc3339()
                ),
                None => println!("no failed restart"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Prune => {
            let removed = cli
                .open()?
                .prune(now)
                .map_err(|e| miette::miette!("prune failed: {}", e))?;
            for id in &removed {
                println!("removed {}", id);
            }
            println!("{} checkpoints removed", removed.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Checkpoints => {
            let checkpoints = cli
                .open_read_only()?
                .checkpoints()
                .map_err(|e| miette::miette!("{}", e))?;
            for checkpoint in checkpoints {
                println!(
                    "{}  {:<10}  {:>4} files  {}",
                    checkpoint.id,
                    if checkpoint.complete { "complete" } else { "incomplete" },
                    checkpoint.files.len(),
                    checkpoint.reason
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::RegisterWorker { worker_id, task } => {
            let record = cli
                .open()?
                .register_worker(worker_id, task.clone(), now)
                .map_err(|e| miette::miette!("{}", e))?;
            println!("{} {:?}", record.worker_id, record.status);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Watch => {
            let orchestrator = Arc::new(cli.open()?);
            daemon::run(orchestrator, cli.watchdog_config()).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Supervise {
            heartbeat_stale_secs,
        } => {
            let watchdog = cli.watchdog_config();
            let stale_after = heartbeat_stale_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| watchdog.default_stale_after());
            let state_root = cli.state_root()?;
            supervisor::run(supervisor::SupervisorConfig {
                child_args: cli.watch_args(&state_root),
                state_root,
                poll_interval: watchdog.poll_interval,
                stale_after,
            })
            .await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
