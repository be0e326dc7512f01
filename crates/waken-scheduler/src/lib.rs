//! Restart scheduling and resumption for waken.
//!
//! This crate turns a reset announcement into a durable restart record and
//! drives it to completion:
//! - Parses "resets at 2:30pm (Zone)" text into a UTC wake instant
//! - Keeps at most one pending restart record, surviving crashes
//! - Polls the record and restores the referenced checkpoint when due
//! - Retries failed restores with exponential backoff, then fails loudly

mod config;
mod error;
mod health;
pub mod heartbeat;
mod orchestrator;
mod restorer;
mod scheduler;
pub mod signal;
mod types;
mod watchdog;

pub use config::{DEFAULT_POLL_INTERVAL_SECS, OrchestratorConfig, WatchdogConfig};
pub use error::SchedulerError;
pub use health::{HealthReport, HealthReporter};
pub use orchestrator::Orchestrator;
pub use restorer::{LifecycleEvent, RestoreOutcome, StateRestorer};
pub use scheduler::RestartScheduler;
pub use signal::ParseError;
pub use types::{
    DEFAULT_MAX_ATTEMPTS, ResetSchedule, RetryPolicy, ScheduleOrigin, ScheduleStatus,
};
pub use watchdog::{TickOutcome, Watchdog};
