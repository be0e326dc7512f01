//! Configuration for the orchestrator and the watchdog loop.

use std::time::Duration;

use waken_store::RetentionPolicy;

use crate::RetryPolicy;

/// Default seconds between watchdog ticks.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Persistence-side settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub retention: RetentionPolicy,
    pub retry: RetryPolicy,
}

/// Watchdog loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Fixed-cycle fallback period. `None` disables the fallback.
    pub cycle: Option<chrono::Duration>,
    /// Scan `<root>/inbox/` for dropped trigger files on each tick.
    pub inbox_enabled: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            cycle: None,
            inbox_enabled: true,
        }
    }
}

impl WatchdogConfig {
    /// How long without a heartbeat before the watchdog counts as stalled.
    pub fn default_stale_after(&self) -> Duration {
        self.poll_interval * 4
    }
}
