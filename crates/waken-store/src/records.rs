//! Worker records and the system status singleton.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fsio::{self, is_temp_name};
use crate::{CheckpointId, StateLayout, StoreError};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Known but not doing anything.
    #[default]
    Idle,
    /// Running tasks.
    Active,
    /// Being brought back after a suspension.
    Restarting,
}

/// Persistent record for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_ref: Option<String>,
}

impl WorkerRecord {
    /// A new idle worker.
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Idle,
            last_active_at: now,
            restarted_at: None,
            current_task_ref: None,
        }
    }

    /// Mark this worker as resumed at `now`.
    pub fn resume(&mut self, now: DateTime<Utc>) {
        self.status = WorkerStatus::Active;
        self.restarted_at = Some(now);
    }
}

/// Overall state of the worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    /// No restore has happened yet.
    #[default]
    Idle,
    /// A restore is in progress (or crashed part-way).
    Restoring,
    /// Workers have been resumed.
    Running,
}

/// System-wide status singleton.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub overall_status: OverallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restore_at: Option<DateTime<Utc>>,
    pub session_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<CheckpointId>,
}

/// Load/save access to worker records, the status singleton and the event log.
#[derive(Debug, Clone)]
pub struct RecordStore {
    layout: StateLayout,
}

impl RecordStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    fn worker_path(&self, worker_id: &str) -> Result<PathBuf, StoreError> {
        validate_worker_id(worker_id)?;
        Ok(self.layout.workers_dir().join(format!("{}.json", worker_id)))
    }

    /// Load a single worker record.
    pub fn load_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, StoreError> {
        fsio::load_json(&self.worker_path(worker_id)?)
    }

    /// Persist a worker record.
    pub fn save_worker(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        fsio::save_json(&self.worker_path(&record.worker_id)?, record)
    }

    /// Create a worker record, or refresh an existing one's activity stamp and
    /// task reference.
    pub fn register_worker(
        &self,
        worker_id: &str,
        task_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkerRecord, StoreError> {
        let mut record = self
            .load_worker(worker_id)?
            .unwrap_or_else(|| WorkerRecord::new(worker_id, now));
        record.last_active_at = now;
        if task_ref.is_some() {
            record.current_task_ref = task_ref;
        }
        self.save_worker(&record)?;
        debug!(worker_id, "registered worker");
        Ok(record)
    }

    /// All worker records, ordered by id.
    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let dir = self.layout.workers_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut workers = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if is_temp_name(name) || !name.ends_with(".json") {
                continue;
            }
            if let Some(record) = fsio::load_json::<WorkerRecord>(&path)? {
                workers.push(record);
            }
        }
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    /// Load the status singleton.
    pub fn load_status(&self) -> Result<Option<SystemStatus>, StoreError> {
        fsio::load_json(&self.layout.status_file())
    }

    /// Persist the status singleton.
    pub fn save_status(&self, status: &SystemStatus) -> Result<(), StoreError> {
        fsio::save_json(&self.layout.status_file(), status)
    }

    /// Append one event as a JSON line.
    pub fn append_event<T: Serialize>(&self, event: &T) -> Result<(), StoreError> {
        let path = self.layout.events_file();
        let mut line = serde_json::to_vec(event).map_err(|e| StoreError::json(&path, e))?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    /// The most recent event in the log, skipping a torn final line.
    pub fn last_event<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        let path = self.layout.events_file();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut last = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => last = Some(event),
                Err(e) => warn!(error = %e, "skipping unreadable event line"),
            }
        }
        Ok(last)
    }
}

fn validate_worker_id(worker_id: &str) -> Result<(), StoreError> {
    let valid = !worker_id.is_empty()
        && !worker_id.starts_with('.')
        && worker_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidWorkerId(worker_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        layout.ensure().unwrap();
        (dir, RecordStore::new(layout))
    }

    #[test]
    fn test_register_creates_idle_worker() {
        let (_dir, store) = store();
        let now = Utc::now();
        let record = store
            .register_worker("w1", Some("task-7".to_string()), now)
            .unwrap();

        assert_eq!(record.status, WorkerStatus::Idle);
        assert_eq!(record.current_task_ref.as_deref(), Some("task-7"));
        assert_eq!(store.load_worker("w1").unwrap(), Some(record));
    }

    #[test]
    fn test_register_keeps_status_of_existing_worker() {
        let (_dir, store) = store();
        let now = Utc::now();
        let mut record = store.register_worker("w1", None, now).unwrap();
        record.resume(now);
        store.save_worker(&record).unwrap();

        let refreshed = store.register_worker("w1", None, now).unwrap();
        assert_eq!(refreshed.status, WorkerStatus::Active);
    }

    #[test]
    fn test_list_workers_sorted() {
        let (_dir, store) = store();
        let now = Utc::now();
        for id in ["w3", "w1", "w2"] {
            store.register_worker(id, None, now).unwrap();
        }
        let ids: Vec<_> = store
            .list_workers()
            .unwrap()
            .into_iter()
            .map(|w| w.worker_id)
            .collect();
        assert_eq!(ids, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_invalid_worker_ids_rejected() {
        let (_dir, store) = store();
        for id in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(
                store.register_worker(id, None, Utc::now()),
                Err(StoreError::InvalidWorkerId(_))
            ));
        }
    }

    #[test]
    fn test_status_roundtrip_and_default() {
        let (_dir, store) = store();
        assert!(store.load_status().unwrap().is_none());

        let status = SystemStatus {
            overall_status: OverallStatus::Running,
            last_restore_at: Some(Utc::now()),
            session_count: 2,
            last_checkpoint_id: None,
        };
        store.save_status(&status).unwrap();
        assert_eq!(store.load_status().unwrap(), Some(status));
    }

    #[test]
    fn test_last_event_skips_torn_line() {
        let (_dir, store) = store();
        store.append_event(&serde_json::json!({"n": 1})).unwrap();
        store.append_event(&serde_json::json!({"n": 2})).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.layout().events_file())
            .unwrap();
        file.write_all(b"{\"n\": 3").unwrap();

        let last: Option<serde_json::Value> = store.last_event().unwrap();
        assert_eq!(last, Some(serde_json::json!({"n": 2})));
    }
}
