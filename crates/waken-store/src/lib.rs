//! Durable on-disk state for waken.
//!
//! This crate owns everything that crosses the durability boundary:
//!
//! - **Layout**: the state-root directory tree and the `live` symlink
//! - **Records**: worker records and the system status singleton
//! - **Checkpoints**: atomic snapshots of the live tree, restore by swap, pruning
//!
//! Every write goes through write-then-rename, so a reader never observes a
//! half-written file.

pub mod checkpoint;
mod error;
pub mod fsio;
mod layout;
mod lock;
pub mod records;
pub mod retention;

pub use checkpoint::{Checkpoint, CheckpointId, CheckpointStore, ManifestEntry, RestoreReport};
pub use error::StoreError;
pub use layout::StateLayout;
pub use lock::{LockGuard, StoreLock};
pub use records::{OverallStatus, RecordStore, SystemStatus, WorkerRecord, WorkerStatus};
pub use retention::RetentionPolicy;
