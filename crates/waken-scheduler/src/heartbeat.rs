//! Heartbeat file written by the watchdog on every tick.

use chrono::{DateTime, Duration, Utc};

use waken_store::fsio;
use waken_store::{StateLayout, StoreError};

/// Record that the watchdog was alive at `now`.
pub fn write(layout: &StateLayout, now: DateTime<Utc>) -> Result<(), StoreError> {
    fsio::atomic_write(&layout.heartbeat_file(), now.to_rfc3339().as_bytes())?;
    Ok(())
}

/// The last heartbeat, if one was ever written and is readable.
pub fn read(layout: &StateLayout) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw = match std::fs::read_to_string(layout.heartbeat_file()) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|at| at.with_timezone(&Utc)))
}

/// Whether a heartbeat at `last` is older than `stale_after` at `now`.
/// A missing heartbeat counts as stale.
pub fn is_stale(last: Option<DateTime<Utc>>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match last {
        Some(at) => now - at > stale_after,
        None => true,
    }
}
