//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use waken_store::CheckpointId;

/// The pending restart record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSchedule {
    /// When the external resource is expected back.
    pub scheduled_at: DateTime<Utc>,
    /// The announcement this schedule was parsed from.
    pub source_text: String,
    /// When the announcement was received.
    pub detected_at: DateTime<Utc>,
    /// Checkpoint to restore at wake time.
    pub checkpoint_id: CheckpointId,
    /// Current lifecycle state.
    pub status: ScheduleStatus,
    /// What created this schedule.
    #[serde(default)]
    pub origin: ScheduleOrigin,
    /// Consecutive failed restore attempts (resets never; the record is
    /// archived on success).
    #[serde(default)]
    pub attempts: u32,
    /// Earliest instant of the next retry after a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    /// When the record reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a restart record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for the wake instant.
    #[default]
    Pending,
    /// Restored successfully.
    Triggered,
    /// Cancelled by an operator.
    Cancelled,
    /// Gave up after repeated restore failures.
    Failed { error: String },
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStatus::Pending => f.write_str("pending"),
            ScheduleStatus::Triggered => f.write_str("triggered"),
            ScheduleStatus::Cancelled => f.write_str("cancelled"),
            ScheduleStatus::Failed { .. } => f.write_str("failed"),
        }
    }
}

/// Where a schedule came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOrigin {
    /// Parsed from a reset announcement.
    #[default]
    Signal,
    /// Created by the fixed-cycle fallback.
    FixedCycle,
}

impl ResetSchedule {
    /// Create a new pending schedule.
    pub fn new(
        scheduled_at: DateTime<Utc>,
        source_text: impl Into<String>,
        detected_at: DateTime<Utc>,
        checkpoint_id: CheckpointId,
    ) -> Self {
        Self {
            scheduled_at,
            source_text: source_text.into(),
            detected_at,
            checkpoint_id,
            status: ScheduleStatus::Pending,
            origin: ScheduleOrigin::Signal,
            attempts: 0,
            retry_after: None,
            resolved_at: None,
        }
    }

    pub fn with_origin(mut self, origin: ScheduleOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == ScheduleStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ScheduleStatus::Failed { .. })
    }

    /// Whether a restore should be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending()
            && self.scheduled_at <= now
            && self.retry_after.is_none_or(|retry| retry <= now)
    }

    /// Time left until the wake instant (zero once due).
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.scheduled_at - now).max(Duration::zero())
    }
}

/// Default number of restore attempts before a schedule fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Bounded retry policy for failed restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_secs: i64,
    pub max_backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff_secs: 30,
            max_backoff_secs: 300,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempts` consecutive failures.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        // Exponential backoff: base, 2×base, 4×base, ... capped.
        let exponent = attempts.saturating_sub(1).min(16);
        let backoff = self.base_backoff_secs.saturating_mul(1i64 << exponent);
        Duration::seconds(backoff.min(self.max_backoff_secs).max(0))
    }
}
