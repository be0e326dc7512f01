//! State-root directory layout.
//!
//! ```text
//! <root>/
//!   schedule.json        pending restart record
//!   history/             archived restart records
//!   checkpoints/<id>/    manifest.json, COMPLETE, files/...
//!   live -> trees/<gen>  live state tree
//!   status.json          system status singleton
//!   events.jsonl         restore completion events
//!   heartbeat            last watchdog tick
//!   inbox/               dropped trigger files
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{info, warn};

use crate::StoreError;
use crate::fsio;

/// Directory holding worker records inside the live tree.
pub const WORKERS_DIR: &str = "workers";

static GENERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Paths under a state root.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at `root`. Nothing is created until [`ensure`](Self::ensure).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schedule_file(&self) -> PathBuf {
        self.root.join("schedule.json")
    }

    pub fn schedule_lock(&self) -> PathBuf {
        self.root.join("schedule.lock")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn checkpoints_lock(&self) -> PathBuf {
        self.root.join("checkpoints.lock")
    }

    pub fn trees_dir(&self) -> PathBuf {
        self.root.join("trees")
    }

    /// The live state tree (a symlink to the current generation on unix).
    pub fn live_dir(&self) -> PathBuf {
        self.root.join("live")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.live_dir().join(WORKERS_DIR)
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn events_file(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.root.join("heartbeat")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.root.join("inbox")
    }

    /// Create the directory skeleton and make sure `live` points at a
    /// generation directory.
    pub fn ensure(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.history_dir(),
            self.checkpoints_dir(),
            self.trees_dir(),
            self.inbox_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        self.ensure_live()
    }

    /// A fresh, unused generation directory path under `trees/`.
    pub fn new_generation_path(&self, label: &str) -> PathBuf {
        let n = GENERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.trees_dir().join(format!(
            "{}-{}-{}-{}",
            label,
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            std::process::id(),
            n
        ))
    }

    /// Resolve the generation directory `live` currently points at.
    pub fn live_target(&self) -> Result<PathBuf, StoreError> {
        let live = self.live_dir();
        let meta = fs::symlink_metadata(&live)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&live)?;
            Ok(if target.is_absolute() {
                target
            } else {
                self.root.join(target)
            })
        } else {
            Ok(live)
        }
    }

    #[cfg(unix)]
    fn ensure_live(&self) -> Result<(), StoreError> {
        let live = self.live_dir();
        match fs::symlink_metadata(&live) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if !live.is_dir() {
                    return Err(StoreError::Layout(format!(
                        "{} is a dangling symlink",
                        live.display()
                    )));
                }
                Ok(())
            }
            Ok(meta) if meta.is_dir() => {
                // A plain directory from before the first start: adopt it as
                // the initial generation.
                let generation = self.new_generation_path("adopted");
                fs::rename(&live, &generation)?;
                self.point_live_at(&generation)?;
                info!(generation = %generation.display(), "adopted existing live directory");
                Ok(())
            }
            Ok(_) => Err(StoreError::Layout(format!(
                "{} exists and is not a directory",
                live.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let generation = self.new_generation_path("init");
                fs::create_dir_all(generation.join(WORKERS_DIR))?;
                self.point_live_at(&generation)?;
                info!(generation = %generation.display(), "initialised live tree");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(unix))]
    fn ensure_live(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.workers_dir())?;
        Ok(())
    }

    #[cfg(unix)]
    fn point_live_at(&self, generation: &Path) -> Result<(), StoreError> {
        let name = generation
            .file_name()
            .ok_or_else(|| StoreError::Layout(format!("bad generation {}", generation.display())))?;
        let target = Path::new("trees").join(name);
        let temp = fsio::temp_path_for(&self.live_dir());
        std::os::unix::fs::symlink(&target, &temp)?;
        if let Err(e) = fs::rename(&temp, self.live_dir()) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        fsio::sync_dir(&self.root);
        Ok(())
    }

    /// Atomically make `generation` the live tree and delete the previous one.
    ///
    /// On unix the swap is a single rename of a freshly created symlink over
    /// `live`. Elsewhere it falls back to two directory renames.
    pub fn swap_live(&self, generation: &Path) -> Result<(), StoreError> {
        let previous = self.live_target()?;
        self.swap_live_inner(generation)?;
        if previous != self.live_dir()
            && previous != generation
            && let Err(e) = fs::remove_dir_all(&previous)
        {
            warn!(path = %previous.display(), error = %e, "failed to remove superseded generation");
        }
        Ok(())
    }

    #[cfg(unix)]
    fn swap_live_inner(&self, generation: &Path) -> Result<(), StoreError> {
        self.point_live_at(generation)
    }

    #[cfg(not(unix))]
    fn swap_live_inner(&self, generation: &Path) -> Result<(), StoreError> {
        let live = self.live_dir();
        let retired = self.new_generation_path("retired");
        fs::rename(&live, &retired)?;
        if let Err(e) = fs::rename(generation, &live) {
            let _ = fs::rename(&retired, &live);
            return Err(e.into());
        }
        let _ = fs::remove_dir_all(&retired);
        Ok(())
    }

    /// Remove generation directories that `live` no longer points at, such as
    /// staging trees left behind by a crash mid-restore.
    pub fn sweep_generations(&self) -> Result<usize, StoreError> {
        let current = self.live_target()?;
        let mut removed = 0;
        for entry in fs::read_dir(self.trees_dir())? {
            let path = entry?.path();
            if path != current && path.is_dir() {
                fs::remove_dir_all(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
