use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use crate::record::RecordState;
use crate::{Result, StorageError, StoreStats};

/// Durable home of reconfiguration records.
///
/// Implementations hand out copies: a caller mutates its copy and writes it
/// back with `put`. Callers serialize read-modify-write cycles per name with
/// [`RecordLocks`](crate::RecordLocks).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<RecordState>>;

    async fn put(&self, record: RecordState) -> Result<()>;

    /// Returns true if a record was removed.
    async fn delete(&self, name: &str) -> Result<bool>;

    async fn scan_all(&self) -> Result<Vec<RecordState>>;
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    checksum: String,
    records: Vec<u8>,
}

pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, RecordState>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            snapshot_path: None,
        }
    }

    /// Store backed by a snapshot file under `dir`. An existing snapshot is
    /// loaded; a missing one starts the store empty.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        let snapshot_path = dir.join("records.snapshot");
        let records = match fs::read(&snapshot_path).await {
            Ok(bytes) => Self::decode_snapshot(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Record store opened at {:?} with {} records",
            snapshot_path,
            records.len()
        );

        Ok(Self {
            records: RwLock::new(records),
            snapshot_path: Some(snapshot_path),
        })
    }

    /// Writes all records to the snapshot file, if one is configured.
    pub async fn save_snapshot(&self) -> Result<()> {
        let path = match &self.snapshot_path {
            Some(path) => path,
            None => return Ok(()),
        };

        let bytes = {
            let records = self.records.read().await;
            let list: Vec<&RecordState> = records.values().collect();
            let encoded = bincode::serialize(&list)?;
            bincode::serialize(&Snapshot {
                checksum: checksum(&encoded),
                records: encoded,
            })?
        };

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;

        tracing::debug!("Saved record snapshot to {:?}", path);
        Ok(())
    }

    pub async fn stats(&self) -> StoreStats {
        let records = self.records.read().await;
        StoreStats {
            total_records: records.len(),
            marked_for_removal: records
                .values()
                .filter(|record| record.is_marked_for_removal())
                .count(),
        }
    }

    fn decode_snapshot(bytes: &[u8]) -> Result<BTreeMap<String, RecordState>> {
        let snapshot: Snapshot = bincode::deserialize(bytes)?;
        if checksum(&snapshot.records) != snapshot.checksum {
            return Err(StorageError::Corruption(
                "Record snapshot failed integrity check".to_string(),
            ));
        }

        let list: Vec<RecordState> = bincode::deserialize(&snapshot.records)?;
        Ok(list
            .into_iter()
            .map(|record| (record.name().to_string(), record))
            .collect())
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, name: &str) -> Result<Option<RecordState>> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn put(&self, record: RecordState) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.name().to_string(), record);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self.records.write().await.remove(name).is_some();
        if removed {
            tracing::info!("Deleted record: {}", name);
        }
        Ok(removed)
    }

    async fn scan_all(&self) -> Result<Vec<RecordState>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
