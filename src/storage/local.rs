//! Local filesystem storage implementation.
//!
//! Wraps a [`MemoryStore`] and writes a JSON snapshot after every mutation,
//! for development and single-node deployments.
//!
//! ## Storage Layout
//!
//! ```text
//! {root}/
//! └── store.json    # Documents, revisions and tombstones for all collections
//! ```
//!
//! Snapshots are written to a temp file and renamed into place, so a crash
//! leaves either the old or the new snapshot, never a torn one. If the write
//! fails the mutation is rolled back in memory and the caller receives a
//! `TransientStore` error, so a retry starts from the persisted state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{Collection, ContentHash, Document, Record, Tombstone};
use crate::storage::memory::StoreSnapshot;
use crate::storage::{
    BulkUpsertReport, ChangeSet, CollectionStats, MemoryStore, RecordRepository, Versioned,
};

const SNAPSHOT_KEY: &str = "store.json";

/// Local filesystem storage backend.
pub struct LocalStorage {
    root_dir: PathBuf,
    inner: MemoryStore,
    persist_lock: Mutex<()>,
}

impl LocalStorage {
    /// Open the store rooted at the given directory, loading any snapshot.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        let inner = match read_json::<StoreSnapshot>(&root_dir.join(SNAPSHOT_KEY)).await? {
            Some(snapshot) => {
                log::info!("Loaded store snapshot from {}", root_dir.display());
                MemoryStore::from_snapshot(snapshot)?
            }
            None => {
                log::info!("No snapshot in {}, starting empty", root_dir.display());
                MemoryStore::new()
            }
        };

        Ok(Self {
            root_dir,
            inner,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Write the current snapshot to disk.
    async fn persist(&self) -> Result<()> {
        let snapshot = self.inner.snapshot().await;
        write_json(&self.path(SNAPSHOT_KEY), &snapshot)
            .await
            .map_err(|e| {
                log::error!("Failed to persist store snapshot: {}", e);
                AppError::transient(format!("snapshot write failed: {e}"))
            })
    }

    /// Run a mutation and persist its result under the persist lock.
    ///
    /// A failed persist restores the pre-mutation state before the error is
    /// returned.
    async fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let _guard = self.persist_lock.lock().await;
        let before = self.inner.snapshot().await;
        let value = op.await?;
        if let Err(e) = self.persist().await {
            log::warn!("Rolling back unpersisted mutation in {}", self.root_dir.display());
            self.inner.restore(before).await?;
            return Err(e);
        }
        Ok(value)
    }
}

/// Ensure parent directory exists.
async fn ensure_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write bytes atomically (write to temp, then rename).
async fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    ensure_dir(path).await?;

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes(path, &bytes).await
}

/// Read JSON data, returning None if the file doesn't exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Io(e)),
    }
}

#[async_trait]
impl RecordRepository for LocalStorage {
    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Versioned<Record>>> {
        self.inner.find_by_hash(hash).await
    }

    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Versioned<Document>>> {
        self.inner.find_by_id(collection, id).await
    }

    async fn insert_record(&self, record: Record) -> Result<Versioned<Record>> {
        self.mutate(self.inner.insert_record(record)).await
    }

    async fn compare_and_swap(
        &self,
        expected: &Versioned<Record>,
        next: Record,
    ) -> Result<Versioned<Record>> {
        self.mutate(self.inner.compare_and_swap(expected, next)).await
    }

    async fn bulk_upsert(
        &self,
        collection: Collection,
        items: Vec<Document>,
    ) -> Result<BulkUpsertReport> {
        self.mutate(self.inner.bulk_upsert(collection, items)).await
    }

    async fn changes_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<ChangeSet> {
        self.inner.changes_since(collection, since, limit).await
    }

    async fn tombstones_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
    ) -> Result<Vec<Tombstone>> {
        self.inner.tombstones_since(collection, since).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<Option<Tombstone>> {
        self.mutate(self.inner.delete(collection, id)).await
    }

    async fn stats(&self, collection: Collection) -> Result<CollectionStats> {
        self.inner.stats(collection).await
    }

    async fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.mutate(self.inner.purge_tombstones(older_than)).await
    }

    fn server_time(&self) -> DateTime<Utc> {
        self.inner.server_time()
    }
}
