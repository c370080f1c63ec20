mod demand;
mod engine;
mod locks;
mod progress;
mod record;

pub use demand::{DemandStats, MovingAverage, NodeDemand};
pub use engine::{MemoryRecordStore, RecordStore};
pub use locks::RecordLocks;
pub use progress::{ProgressTracker, Stage, StageEntry};
pub use record::{ActiveState, RecordState, RemovalRequest};

use consensus::TransitionId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for record snapshots. `None` keeps records in memory only.
    pub storage_path: Option<PathBuf>,
    pub snapshot_interval_ms: u64,
    pub moving_average_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_records: usize,
    pub marked_for_removal: usize,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Record {name} is {state:?}; a transition is already in progress")]
    TransitionInProgress { name: String, state: ActiveState },

    #[error("Record {name} already uses transition id {transition_id}")]
    DuplicateTransition {
        name: String,
        transition_id: TransitionId,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
