//! Client-side offline cache.
//!
//! One table per collection, every row tagged with its sync status, a FIFO
//! queue of pending local changes, and a per-collection sync cursor. The
//! whole state is persisted through a [`CacheBackend`] after each mutation.
//! A failed persist keeps the in-memory change (pending edits are never
//! dropped) and marks the cache dirty so the next mutation or
//! [`LocalCache::flush`] writes it out.

pub mod backend;
pub mod client;
pub mod transport;

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{Collection, Document, SyncStatus};
use crate::utils::time;

pub use backend::{FileBackend, MemoryBackend};
pub use client::{SyncClient, SyncReport};
pub use transport::{LocalTransport, SyncTransport};
#[cfg(feature = "http")]
pub use transport::HttpTransport;

/// Persistence for the cache snapshot.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self) -> Result<Option<CacheSnapshot>>;
    async fn save(&self, snapshot: &CacheSnapshot) -> Result<()>;
}

/// One cached row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub doc: Document,
    pub sync_status: SyncStatus,
    /// Bumped on every local change; guards acknowledgements
    pub local_rev: u64,
}

/// A pending row together with the local revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub doc: Document,
    pub local_rev: u64,
}

/// Client-held watermark for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    #[serde(with = "time::flexible")]
    pub last_sync_timestamp: DateTime<Utc>,
}

/// Summary of applying a pull page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    /// Server rows not applied because a local change is pending
    pub skipped_pending: usize,
    pub purged: usize,
}

/// Serializable cache state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    #[serde(default)]
    tables: BTreeMap<Collection, BTreeMap<String, CacheEntry>>,
    #[serde(default)]
    pending: BTreeMap<Collection, VecDeque<String>>,
    #[serde(default)]
    cursors: BTreeMap<Collection, SyncCursor>,
    #[serde(default)]
    next_rev: u64,
}

impl CacheSnapshot {
    fn table_mut(&mut self, collection: Collection) -> &mut BTreeMap<String, CacheEntry> {
        self.tables.entry(collection).or_default()
    }

    fn queue_mut(&mut self, collection: Collection) -> &mut VecDeque<String> {
        self.pending.entry(collection).or_default()
    }

    fn bump(&mut self) -> u64 {
        self.next_rev += 1;
        self.next_rev
    }

    fn drop_from_queue(&mut self, collection: Collection, id: &str) {
        if let Some(queue) = self.pending.get_mut(&collection) {
            queue.retain(|queued| queued != id);
        }
    }
}

struct CacheInner {
    state: CacheSnapshot,
    dirty: bool,
}

/// Offline-first cache of server collections.
pub struct LocalCache {
    inner: Mutex<CacheInner>,
    backend: Box<dyn CacheBackend>,
}

impl LocalCache {
    /// Open a cache, restoring whatever the backend holds.
    pub async fn open(backend: impl CacheBackend + 'static) -> Result<Self> {
        let state = backend.load().await?.unwrap_or_default();
        Ok(Self {
            inner: Mutex::new(CacheInner {
                state,
                dirty: false,
            }),
            backend: Box::new(backend),
        })
    }

    /// In-memory cache with no durable backing.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                state: CacheSnapshot::default(),
                dirty: false,
            }),
            backend: Box::new(MemoryBackend::new()),
        }
    }

    async fn persist(&self, inner: &mut CacheInner) {
        match self.backend.save(&inner.state).await {
            Ok(()) => inner.dirty = false,
            Err(e) => {
                log::warn!("Cache persist failed, keeping changes in memory: {}", e);
                inner.dirty = true;
            }
        }
    }

    /// Retry persisting after an earlier failure.
    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.dirty {
            self.backend.save(&inner.state).await?;
            inner.dirty = false;
        }
        Ok(())
    }

    /// Whether the last persist failed.
    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.dirty
    }

    /// Apply an incremental pull result.
    ///
    /// Rows with a pending local change are left alone: the push carries
    /// them and the server decides. Deleted ids are purged outright.
    pub async fn upsert_from_server(
        &self,
        collection: Collection,
        records: Vec<Document>,
        deleted_ids: &[String],
    ) -> Result<ApplyReport> {
        let mut inner = self.inner.lock().await;
        let mut report = ApplyReport::default();
        let state = &mut inner.state;

        for doc in records {
            let table = state.table_mut(collection);
            if table
                .get(&doc.id)
                .is_some_and(|e| e.sync_status == SyncStatus::Pending)
            {
                report.skipped_pending += 1;
                continue;
            }
            let local_rev = table.get(&doc.id).map_or(0, |e| e.local_rev);
            table.insert(
                doc.id.clone(),
                CacheEntry {
                    doc,
                    sync_status: SyncStatus::Synced,
                    local_rev,
                },
            );
            report.applied += 1;
        }

        for id in deleted_ids {
            if state.table_mut(collection).remove(id).is_some() {
                report.purged += 1;
            }
            state.drop_from_queue(collection, id);
        }

        self.persist(&mut inner).await;
        Ok(report)
    }

    /// Record a local edit; it is pushed on the next sync.
    pub async fn enqueue_local_change(&self, collection: Collection, doc: Document) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = &mut inner.state;
        let local_rev = state.bump();
        let id = doc.id.clone();

        state.table_mut(collection).insert(
            id.clone(),
            CacheEntry {
                doc,
                sync_status: SyncStatus::Pending,
                local_rev,
            },
        );
        let queue = state.queue_mut(collection);
        if !queue.contains(&id) {
            queue.push_back(id);
        }

        self.persist(&mut inner).await;
        Ok(())
    }

    /// Pending rows in enqueue order.
    pub async fn get_pending(&self, collection: Collection) -> Vec<Document> {
        self.pending_changes(collection)
            .await
            .into_iter()
            .map(|change| change.doc)
            .collect()
    }

    /// Pending rows in enqueue order, with their local revisions.
    pub async fn pending_changes(&self, collection: Collection) -> Vec<PendingChange> {
        let inner = self.inner.lock().await;
        let state = &inner.state;
        let (Some(queue), Some(table)) =
            (state.pending.get(&collection), state.tables.get(&collection))
        else {
            return Vec::new();
        };
        queue
            .iter()
            .filter_map(|id| table.get(id))
            .filter(|e| e.sync_status == SyncStatus::Pending)
            .map(|e| PendingChange {
                doc: e.doc.clone(),
                local_rev: e.local_rev,
            })
            .collect()
    }

    pub async fn pending_count(&self, collection: Collection) -> usize {
        let inner = self.inner.lock().await;
        inner.state.pending.get(&collection).map_or(0, VecDeque::len)
    }

    /// Flip rows to synced after a confirmed push.
    pub async fn mark_synced(&self, collection: Collection, ids: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = &mut inner.state;
        for id in ids {
            if let Some(entry) = state.table_mut(collection).get_mut(id) {
                entry.sync_status = SyncStatus::Synced;
            }
            state.drop_from_queue(collection, id);
        }
        self.persist(&mut inner).await;
        Ok(())
    }

    /// Like [`Self::mark_synced`], but skips rows edited again since they
    /// were read for the push. Returns how many were acknowledged.
    pub async fn acknowledge(&self, collection: Collection, acks: &[(String, u64)]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let state = &mut inner.state;
        let mut acknowledged = 0;
        for (id, local_rev) in acks {
            let table = state.table_mut(collection);
            match table.get_mut(id) {
                Some(entry) if entry.local_rev == *local_rev => {
                    entry.sync_status = SyncStatus::Synced;
                    state.drop_from_queue(collection, id);
                    acknowledged += 1;
                }
                Some(_) => log::debug!("{}/{} changed during push, keeping it pending", collection, id),
                None => state.drop_from_queue(collection, id),
            }
        }
        self.persist(&mut inner).await;
        Ok(acknowledged)
    }

    /// Replace a rejected local change with the server's copy, or drop it
    /// when the server has none.
    pub async fn adopt_server_copy(
        &self,
        collection: Collection,
        id: &str,
        current: Option<Document>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = &mut inner.state;
        let table = state.table_mut(collection);
        match current {
            Some(doc) => {
                let local_rev = table.get(id).map_or(0, |e| e.local_rev);
                table.insert(
                    id.to_string(),
                    CacheEntry {
                        doc,
                        sync_status: SyncStatus::Synced,
                        local_rev,
                    },
                );
            }
            None => {
                table.remove(id);
            }
        }
        state.drop_from_queue(collection, id);
        self.persist(&mut inner).await;
        Ok(())
    }

    pub async fn get(&self, collection: Collection, id: &str) -> Option<CacheEntry> {
        let inner = self.inner.lock().await;
        inner.state.tables.get(&collection)?.get(id).cloned()
    }

    /// All rows of a collection, ordered by id.
    pub async fn list(&self, collection: Collection) -> Vec<CacheEntry> {
        let inner = self.inner.lock().await;
        inner
            .state
            .tables
            .get(&collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn count(&self, collection: Collection) -> usize {
        let inner = self.inner.lock().await;
        inner.state.tables.get(&collection).map_or(0, BTreeMap::len)
    }

    /// Whether a row is older than `ttl` at `now`. `None` if absent.
    ///
    /// Advisory only; nothing is evicted.
    pub async fn is_stale(
        &self,
        collection: Collection,
        id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        let entry = self.get(collection, id).await?;
        Some(older_than(entry.doc.updated_at, ttl, now))
    }

    /// Whether a pull is due before reading: no cursor yet, or the last
    /// sync is older than `ttl`.
    pub async fn needs_refresh(&self, collection: Collection, ttl: Duration, now: DateTime<Utc>) -> bool {
        match self.cursor(collection).await {
            Some(cursor) => older_than(cursor, ttl, now),
            None => true,
        }
    }

    pub async fn cursor(&self, collection: Collection) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner
            .state
            .cursors
            .get(&collection)
            .map(|c| c.last_sync_timestamp)
    }

    /// Move the cursor forward. Older timestamps are ignored.
    pub async fn advance_cursor(&self, collection: Collection, ts: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let cursors = &mut inner.state.cursors;
        let advanced = match cursors.get(&collection) {
            Some(current) if current.last_sync_timestamp >= ts => false,
            _ => {
                cursors.insert(
                    collection,
                    SyncCursor {
                        last_sync_timestamp: ts,
                    },
                );
                true
            }
        };
        if advanced {
            self.persist(&mut inner).await;
        }
        Ok(advanced)
    }

    /// Start over for a full resync: forget the cursor and every synced
    /// row. Pending rows are kept.
    pub async fn reset_cursor(&self, collection: Collection) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let state = &mut inner.state;
        state.cursors.remove(&collection);
        state
            .table_mut(collection)
            .retain(|_, e| e.sync_status == SyncStatus::Pending);
        log::info!("Cursor for {} reset for full resync", collection);
        self.persist(&mut inner).await;
        Ok(())
    }
}

fn older_than(ts: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(ts) > ttl
}
