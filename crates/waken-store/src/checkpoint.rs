//! Checkpoint store: atomic snapshots of the live tree and restore by swap.
//!
//! A checkpoint directory looks like:
//!
//! ```text
//! checkpoints/20261019T143000123Z/
//!   files/...        copy of the live tree
//!   manifest.json    id, creation time, reason, per-file length and digest
//!   COMPLETE         commit marker, written last
//! ```
//!
//! Every file (including the manifest and the marker) is written under a
//! temporary name and renamed into place, so a directory without `COMPLETE`
//! is by construction an interrupted snapshot and is never restored.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::fsio::{self, is_temp_name};
use crate::layout::WORKERS_DIR;
use crate::{LockGuard, RetentionPolicy, StateLayout, StoreError, StoreLock};

const MANIFEST_FILE: &str = "manifest.json";
const COMPLETE_MARKER: &str = "COMPLETE";
const FILES_DIR: &str = "files";
const ID_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Timestamp-derived checkpoint identifier (`YYYYMMDDTHHMMSSmmmZ`).
///
/// Fixed width, so lexical order is creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Id for a checkpoint created at `at` (millisecond precision).
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.format(ID_FORMAT).to_string())
    }

    /// Parse and validate an id.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        parse_id_time(s)
            .map(|_| Self(s.to_string()))
            .ok_or_else(|| StoreError::InvalidId(s.to_string()))
    }

    /// The instant encoded in the id.
    pub fn created_at(&self) -> DateTime<Utc> {
        // Construction always validates, so this cannot fail.
        parse_id_time(&self.0).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Smallest id strictly greater than this one.
    fn successor(&self) -> Self {
        Self::from_datetime(self.created_at() + Duration::milliseconds(1))
    }
}

fn parse_id_time(s: &str) -> Option<DateTime<Utc>> {
    let b = s.as_bytes();
    if b.len() != 19 || b[8] != b'T' || b[18] != b'Z' {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = s.get(range)?;
        if part.bytes().all(|c| c.is_ascii_digit()) {
            part.parse().ok()
        } else {
            None
        }
    };
    let date = NaiveDate::from_ymd_opt(digits(0..4)? as i32, digits(4..6)?, digits(6..8)?)?;
    let time = date.and_hms_milli_opt(digits(9..11)?, digits(11..13)?, digits(13..15)?, digits(15..18)?)?;
    Some(Utc.from_utc_datetime(&time))
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CheckpointId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CheckpointId {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CheckpointId> for String {
    fn from(id: CheckpointId) -> Self {
        id.0
    }
}

/// One file captured by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the live tree, `/`-separated.
    pub path: String,
    pub len: u64,
    pub sha256: String,
}

/// Checkpoint metadata. The manifest file is this struct minus `complete`,
/// which is derived from the commit marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub files: Vec<ManifestEntry>,
    #[serde(skip)]
    pub complete: bool,
}

/// Result of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub checkpoint_id: CheckpointId,
    pub files_restored: usize,
}

/// Owner of checkpoint directories and of swaps into the live tree.
#[derive(Debug)]
pub struct CheckpointStore {
    layout: StateLayout,
    lock: StoreLock,
    policy: RetentionPolicy,
}

impl CheckpointStore {
    pub fn new(layout: StateLayout, policy: RetentionPolicy) -> Self {
        let lock = StoreLock::new(layout.checkpoints_lock());
        Self {
            layout,
            lock,
            policy,
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Take the store lock. Snapshot, restore and prune all run under it.
    pub fn lock(&self) -> Result<LockGuard<'_>, StoreError> {
        self.lock.acquire()
    }

    fn checkpoint_dir(&self, id: &CheckpointId) -> PathBuf {
        self.layout.checkpoints_dir().join(id.as_str())
    }

    /// Copy the live tree into a new committed checkpoint.
    #[tracing::instrument(skip(self))]
    pub fn snapshot(&self, reason: &str) -> Result<Checkpoint, StoreError> {
        let guard = self.lock()?;
        self.snapshot_locked(&guard, reason, Utc::now())
    }

    /// [`snapshot`](Self::snapshot) with the lock already held.
    pub fn snapshot_locked(
        &self,
        _guard: &LockGuard<'_>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint, StoreError> {
        let id = self.next_id(now)?;
        let dir = self.checkpoint_dir(&id);
        fs::create_dir_all(self.layout.checkpoints_dir())?;
        fs::create_dir(&dir)?;

        let source = self.layout.live_target()?;
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&source).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                if entry.file_type().is_symlink() {
                    warn!(path = %entry.path().display(), "skipping symlink in live tree");
                }
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if is_temp_name(&name) {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&source)
                .map_err(|e| StoreError::Layout(e.to_string()))?;
            let (len, sha256) = fsio::copy_atomic(entry.path(), &files_dir.join(rel))?;
            files.push(ManifestEntry {
                path: rel_to_string(rel),
                len,
                sha256,
            });
        }

        let mut checkpoint = Checkpoint {
            id: id.clone(),
            created_at: id.created_at(),
            reason: reason.to_string(),
            files,
            complete: false,
        };
        fsio::save_json(&dir.join(MANIFEST_FILE), &checkpoint)?;
        fsio::sync_dir(&files_dir);

        // Commit point.
        fsio::atomic_write(&dir.join(COMPLETE_MARKER), format!("{}\n", id).as_bytes())?;
        checkpoint.complete = true;

        info!(checkpoint = %id, files = checkpoint.files.len(), reason, "checkpoint committed");
        Ok(checkpoint)
    }

    fn next_id(&self, now: DateTime<Utc>) -> Result<CheckpointId, StoreError> {
        let candidate = CheckpointId::from_datetime(now);
        Ok(match self.list_ids()?.pop() {
            Some(last) if last >= candidate => last.successor(),
            _ => candidate,
        })
    }

    fn list_ids(&self) -> Result<Vec<CheckpointId>, StoreError> {
        let entries = match fs::read_dir(self.layout.checkpoints_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| CheckpointId::parse(name).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load checkpoint metadata. A directory without a readable manifest is
    /// reported as an incomplete checkpoint.
    pub fn load(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError> {
        let dir = self.checkpoint_dir(id);
        if !dir.is_dir() {
            return Err(StoreError::CheckpointNotFound(id.clone()));
        }
        let manifest = match fsio::load_json::<Checkpoint>(&dir.join(MANIFEST_FILE)) {
            Ok(manifest) => manifest,
            Err(StoreError::Json { path, source }) => {
                warn!(path = %path.display(), error = %source, "unreadable manifest");
                None
            }
            Err(e) => return Err(e),
        };
        Ok(match manifest {
            Some(mut checkpoint) => {
                checkpoint.complete =
                    checkpoint.id == *id && dir.join(COMPLETE_MARKER).is_file();
                checkpoint
            }
            None => Checkpoint {
                id: id.clone(),
                created_at: id.created_at(),
                reason: String::new(),
                files: Vec::new(),
                complete: false,
            },
        })
    }

    /// All checkpoints, oldest first, incomplete ones included.
    pub fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        self.list_ids()?.iter().map(|id| self.load(id)).collect()
    }

    /// The newest committed checkpoint, if any.
    pub fn most_recent_complete(&self) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.list()?.into_iter().rev().find(|c| c.complete))
    }

    /// Check that a checkpoint is committed and its files are all present
    /// with their recorded lengths. Digests are checked while staging.
    pub fn validate(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if !checkpoint.complete {
            return Err(StoreError::CheckpointIncomplete(checkpoint.id.clone()));
        }
        let files_dir = self.checkpoint_dir(&checkpoint.id).join(FILES_DIR);
        for entry in &checkpoint.files {
            let rel = safe_relative(&entry.path).ok_or_else(|| StoreError::Validation {
                id: checkpoint.id.clone(),
                reason: format!("unsafe path {:?} in manifest", entry.path),
            })?;
            let meta = match fs::metadata(files_dir.join(&rel)) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(StoreError::Validation {
                        id: checkpoint.id.clone(),
                        reason: format!("missing file {}", entry.path),
                    });
                }
                Err(e) => return Err(e.into()),
            };
            if meta.len() != entry.len {
                return Err(StoreError::Validation {
                    id: checkpoint.id.clone(),
                    reason: format!(
                        "{} is {} bytes, manifest says {}",
                        entry.path,
                        meta.len(),
                        entry.len
                    ),
                });
            }
        }
        Ok(())
    }

    /// Validate a checkpoint and atomically swap it in as the live tree.
    #[tracing::instrument(skip(self), fields(checkpoint = %id))]
    pub fn restore(&self, id: &CheckpointId) -> Result<RestoreReport, StoreError> {
        let guard = self.lock()?;
        self.restore_locked(&guard, id)
    }

    /// [`restore`](Self::restore) with the lock already held.
    ///
    /// The live tree is only touched by the final swap; any failure before
    /// it leaves the live tree exactly as it was.
    pub fn restore_locked(
        &self,
        _guard: &LockGuard<'_>,
        id: &CheckpointId,
    ) -> Result<RestoreReport, StoreError> {
        let checkpoint = self.load(id)?;
        self.validate(&checkpoint)?;

        let staging = self.layout.new_generation_path(&format!("restore-{}", id));
        if let Err(e) = self.stage(&checkpoint, &staging) {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!(path = %staging.display(), error = %cleanup, "failed to remove staging tree");
            }
            return Err(e);
        }

        self.layout.swap_live(&staging)?;
        info!(checkpoint = %id, files = checkpoint.files.len(), "live tree restored");
        Ok(RestoreReport {
            checkpoint_id: id.clone(),
            files_restored: checkpoint.files.len(),
        })
    }

    fn stage(&self, checkpoint: &Checkpoint, staging: &Path) -> Result<(), StoreError> {
        let files_dir = self.checkpoint_dir(&checkpoint.id).join(FILES_DIR);
        fs::create_dir_all(staging.join(WORKERS_DIR))?;
        for entry in &checkpoint.files {
            let rel = safe_relative(&entry.path).ok_or_else(|| StoreError::Validation {
                id: checkpoint.id.clone(),
                reason: format!("unsafe path {:?} in manifest", entry.path),
            })?;
            let (len, sha256) = fsio::copy_atomic(&files_dir.join(&rel), &staging.join(&rel))?;
            if len != entry.len || sha256 != entry.sha256 {
                return Err(StoreError::Validation {
                    id: checkpoint.id.clone(),
                    reason: format!("{} does not match its manifest digest", entry.path),
                });
            }
        }
        fsio::sync_dir(staging);
        debug!(staging = %staging.display(), "staged checkpoint");
        Ok(())
    }

    /// Remove checkpoints outside the retention policy. Ids in `protected`
    /// are never removed. Returns the removed ids.
    #[tracing::instrument(skip(self))]
    pub fn prune(
        &self,
        protected: &[CheckpointId],
        now: DateTime<Utc>,
    ) -> Result<Vec<CheckpointId>, StoreError> {
        let _guard = self.lock()?;
        let checkpoints = self.list()?;
        let complete: Vec<_> = checkpoints
            .iter()
            .filter(|c| c.complete)
            .map(|c| (c.id.clone(), c.created_at))
            .collect();
        let keep = self.policy.retained(&complete, now);

        let mut removed = Vec::new();
        for checkpoint in checkpoints {
            if keep.contains(&checkpoint.id) || protected.contains(&checkpoint.id) {
                continue;
            }
            // Holding the lock, so an incomplete checkpoint here is abandoned
            // rather than in flight.
            let dir = self.checkpoint_dir(&checkpoint.id);
            fsio::remove_if_exists(&dir.join(COMPLETE_MARKER))?;
            fs::remove_dir_all(&dir)?;
            debug!(checkpoint = %checkpoint.id, complete = checkpoint.complete, "pruned checkpoint");
            removed.push(checkpoint.id);
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "pruned checkpoints");
        }
        Ok(removed)
    }
}

fn rel_to_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// A manifest path as a relative path that cannot escape its base.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let rel = PathBuf::from(path);
    let ok = !path.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
    ok.then_some(rel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_format_and_parse() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 14, 30, 0).unwrap() + Duration::milliseconds(123);
        let id = CheckpointId::from_datetime(at);

        assert_eq!(id.as_str(), "20261019T143000123Z");
        assert_eq!(id.created_at(), at);
        assert_eq!(CheckpointId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_id_rejects_garbage() {
        for bad in ["", "latest", "20261019T143000123", "20261399T143000123Z", "../20261019T1430"] {
            assert!(CheckpointId::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_id_successor_orders_after() {
        let id = CheckpointId::from_datetime(Utc::now());
        assert!(id.successor() > id);
    }

    #[test]
    fn test_id_serde_validates() {
        let id: CheckpointId = serde_json::from_str("\"20261019T143000123Z\"").unwrap();
        assert_eq!(id.as_str(), "20261019T143000123Z");
        assert!(serde_json::from_str::<CheckpointId>("\"nope\"").is_err());
    }

    #[test]
    fn test_safe_relative() {
        assert!(safe_relative("workers/w1.json").is_some());
        assert!(safe_relative("../etc/passwd").is_none());
        assert!(safe_relative("/abs").is_none());
        assert!(safe_relative("").is_none());
    }
}
