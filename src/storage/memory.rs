//! In-memory repository.
//!
//! All tables live behind a single `RwLock`, so a bulk upsert becomes
//! visible all at once and every compare-and-swap is decided against the
//! latest revision. History records are additionally indexed by content
//! hash.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::{
    Collection, ContentHash, Document, MAX_VALIDATION_SCORE, RESERVED_ID_FIELD, Record, Tombstone,
};
use crate::storage::{
    BulkUpsertReport, ChangeSet, CollectionStats, RecordRepository, StoredDocument, SyncConflict,
    Versioned,
};
use crate::utils::time::{self, ServerClock};

#[derive(Debug, Default)]
struct Table {
    docs: HashMap<String, StoredDocument>,
    hash_index: HashMap<ContentHash, String>,
}

#[derive(Debug, Default)]
struct StoreState {
    tables: HashMap<Collection, Table>,
    tombstones: Vec<Tombstone>,
}

impl StoreState {
    fn table(&self, collection: Collection) -> Option<&Table> {
        self.tables.get(&collection)
    }

    fn table_mut(&mut self, collection: Collection) -> &mut Table {
        self.tables.entry(collection).or_default()
    }
}

/// Serializable image of a store, used by file-backed wrappers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub(crate) tables: BTreeMap<Collection, Vec<StoredDocument>>,
    pub(crate) tombstones: Vec<Tombstone>,
}

/// Repository kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    clock: ServerClock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot, including the hash index.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self> {
        let clock = ServerClock::new();
        let state = Self::load_state(snapshot, &clock)?;
        Ok(Self {
            state: RwLock::new(state),
            clock,
        })
    }

    /// Replace the contents with an earlier snapshot. The clock keeps running.
    pub(crate) async fn restore(&self, snapshot: StoreSnapshot) -> Result<()> {
        let restored = Self::load_state(snapshot, &self.clock)?;
        *self.state.write().await = restored;
        Ok(())
    }

    fn load_state(snapshot: StoreSnapshot, clock: &ServerClock) -> Result<StoreState> {
        let mut state = StoreState::default();

        for (collection, docs) in snapshot.tables {
            let table = state.table_mut(collection);
            for stored in docs {
                clock.observe(stored.doc.updated_at);
                if collection == Collection::History {
                    let record = Record::from_document(&stored.doc)?;
                    table
                        .hash_index
                        .insert(record.content_hash, stored.doc.id.clone());
                }
                table.docs.insert(stored.doc.id.clone(), stored);
            }
        }
        for tombstone in &snapshot.tombstones {
            clock.observe(tombstone.deleted_at);
        }
        state.tombstones = snapshot.tombstones;
        Ok(state)
    }

    /// Capture the current contents.
    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read().await;
        let tables = state
            .tables
            .iter()
            .map(|(collection, table)| {
                let mut docs: Vec<StoredDocument> = table.docs.values().cloned().collect();
                docs.sort_by(|a, b| a.doc.id.cmp(&b.doc.id));
                (*collection, docs)
            })
            .collect();
        StoreSnapshot {
            tables,
            tombstones: state.tombstones.clone(),
        }
    }

    fn checksum<'a>(docs: impl Iterator<Item = &'a Document>) -> String {
        let mut pairs: Vec<(String, String)> = docs
            .map(|d| (d.id.clone(), time::format_utc(&d.updated_at)))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        for (id, updated_at) in pairs {
            hasher.update(id.as_bytes());
            hasher.update(b":");
            hasher.update(updated_at.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Reject a batch up front if any item is malformed.
    fn check_batch(collection: Collection, items: &[Document]) -> Result<Vec<Option<ContentHash>>> {
        items
            .iter()
            .map(|item| {
                if item.body.contains_key(RESERVED_ID_FIELD) {
                    return Err(AppError::invalid_input(format!(
                        "item '{}' carries reserved field '{RESERVED_ID_FIELD}'",
                        item.id
                    )));
                }
                match collection {
                    Collection::History => {
                        let record = Record::from_document(item)
                            .map_err(|e| AppError::invalid_input(e.to_string()))?;
                        if record.validation_score > MAX_VALIDATION_SCORE {
                            return Err(AppError::invalid_input(format!(
                                "item '{}' has validationScore {} above {MAX_VALIDATION_SCORE}",
                                item.id, record.validation_score
                            )));
                        }
                        Ok(Some(record.content_hash))
                    }
                    Collection::Systems => Ok(None),
                }
            })
            .collect()
    }
}

#[async_trait]
impl RecordRepository for MemoryStore {
    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Versioned<Record>>> {
        let state = self.state.read().await;
        let Some(table) = state.table(Collection::History) else {
            return Ok(None);
        };
        let Some(stored) = table.hash_index.get(hash).and_then(|id| table.docs.get(id)) else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            value: Record::from_document(&stored.doc)?,
            revision: stored.revision,
        }))
    }

    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Versioned<Document>>> {
        let state = self.state.read().await;
        Ok(state
            .table(collection)
            .and_then(|t| t.docs.get(id))
            .map(|stored| Versioned {
                value: stored.doc.clone(),
                revision: stored.revision,
            }))
    }

    async fn insert_record(&self, mut record: Record) -> Result<Versioned<Record>> {
        let mut state = self.state.write().await;
        let table = state.table_mut(Collection::History);

        if table.hash_index.contains_key(&record.content_hash) {
            return Err(AppError::conflict(
                record.content_hash.as_str(),
                "a record for this content hash already exists",
            ));
        }
        if table.docs.contains_key(&record.id) {
            return Err(AppError::conflict(&record.id, "record id already taken"));
        }

        let now = self.clock.tick();
        record.updated_at = now;
        let doc = record.to_document()?;
        table
            .hash_index
            .insert(record.content_hash.clone(), record.id.clone());
        table.docs.insert(
            record.id.clone(),
            StoredDocument {
                doc,
                revision: 1,
                writer_clock: now,
            },
        );

        let id = record.id.clone();
        state
            .tombstones
            .retain(|t| !(t.collection == Collection::History && t.record_id == id));

        Ok(Versioned {
            value: record,
            revision: 1,
        })
    }

    async fn compare_and_swap(
        &self,
        expected: &Versioned<Record>,
        mut next: Record,
    ) -> Result<Versioned<Record>> {
        if next.id != expected.value.id || next.content_hash != expected.value.content_hash {
            return Err(AppError::invalid_input(
                "compare-and-swap may not change a record's id or content hash",
            ));
        }

        let mut state = self.state.write().await;
        let table = state.table_mut(Collection::History);
        let Some(stored) = table.docs.get_mut(&next.id) else {
            return Err(AppError::conflict(&next.id, "record was deleted concurrently"));
        };
        if stored.revision != expected.revision {
            return Err(AppError::conflict(
                &next.id,
                format!(
                    "expected revision {}, found {}",
                    expected.revision, stored.revision
                ),
            ));
        }

        let now = self.clock.tick();
        next.updated_at = now;
        stored.doc = next.to_document()?;
        stored.revision += 1;
        stored.writer_clock = now;

        Ok(Versioned {
            value: next,
            revision: stored.revision,
        })
    }

    async fn bulk_upsert(
        &self,
        collection: Collection,
        items: Vec<Document>,
    ) -> Result<BulkUpsertReport> {
        let hashes = Self::check_batch(collection, &items)?;

        let mut state = self.state.write().await;
        let mut inserted = 0;
        let mut updated = 0;
        let mut conflicts = Vec::new();
        let mut revived = Vec::new();

        let table = state.table_mut(collection);
        for (item, hash) in items.into_iter().zip(hashes) {
            let current = table.docs.get(&item.id).map(|s| s.doc.clone());

            if let Some(hash) = &hash {
                let owner = table.hash_index.get(hash);
                if owner.is_some_and(|owner| owner != &item.id) {
                    conflicts.push(SyncConflict {
                        id: item.id,
                        reason: format!("content hash {hash} belongs to another record"),
                        current,
                    });
                    continue;
                }
                let stored_hash = current
                    .as_ref()
                    .and_then(|doc| doc.field("contentHash"))
                    .and_then(|v| v.as_str());
                if stored_hash.is_some_and(|stored| stored != hash.as_str()) {
                    conflicts.push(SyncConflict {
                        id: item.id,
                        reason: "content hash of an existing record cannot change".into(),
                        current,
                    });
                    continue;
                }
            }

            match table.docs.get_mut(&item.id) {
                Some(stored) if item.updated_at < stored.writer_clock => {
                    log::debug!(
                        "Push of {}/{} refused: {} is older than {}",
                        collection,
                        item.id,
                        time::format_utc(&item.updated_at),
                        time::format_utc(&stored.writer_clock)
                    );
                    conflicts.push(SyncConflict {
                        id: item.id,
                        reason: "stale write: a newer version exists".into(),
                        current,
                    });
                }
                Some(stored) => {
                    let now = self.clock.tick();
                    stored.writer_clock = item.updated_at.min(now);
                    stored.doc = Document {
                        id: item.id,
                        updated_at: now,
                        body: item.body,
                    };
                    stored.revision += 1;
                    updated += 1;
                }
                None => {
                    if let Some(hash) = hash {
                        table.hash_index.insert(hash, item.id.clone());
                    }
                    revived.push(item.id.clone());
                    let now = self.clock.tick();
                    table.docs.insert(
                        item.id.clone(),
                        StoredDocument {
                            // A writer clock ahead of the server would freeze the record.
                            writer_clock: item.updated_at.min(now),
                            doc: Document {
                                id: item.id,
                                updated_at: now,
                                body: item.body,
                            },
                            revision: 1,
                        },
                    );
                    inserted += 1;
                }
            }
        }

        if !revived.is_empty() {
            state
                .tombstones
                .retain(|t| !(t.collection == collection && revived.contains(&t.record_id)));
        }

        Ok(BulkUpsertReport {
            inserted,
            updated,
            conflicts,
            server_time: self.clock.tick(),
        })
    }

    async fn changes_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<ChangeSet> {
        let state = self.state.read().await;

        let mut items: Vec<Document> = state
            .table(collection)
            .map(|t| {
                t.docs
                    .values()
                    .filter(|s| s.doc.updated_at >= since)
                    .map(|s| s.doc.clone())
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));

        let has_more = items.len() > limit;
        let timestamp = if has_more {
            let next = items[limit].updated_at;
            items.truncate(limit);
            next
        } else {
            self.clock.tick()
        };

        let deleted = state
            .tombstones
            .iter()
            .filter(|t| t.collection == collection)
            .filter(|t| t.deleted_at >= since && (!has_more || t.deleted_at < timestamp))
            .map(|t| t.record_id.clone())
            .collect();

        Ok(ChangeSet {
            items,
            deleted,
            timestamp,
            has_more,
        })
    }

    async fn tombstones_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
    ) -> Result<Vec<Tombstone>> {
        let state = self.state.read().await;
        Ok(state
            .tombstones
            .iter()
            .filter(|t| t.collection == collection && t.deleted_at >= since)
            .cloned()
            .collect())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<Option<Tombstone>> {
        let mut state = self.state.write().await;
        let table = state.table_mut(collection);
        let Some(removed) = table.docs.remove(id) else {
            return Ok(None);
        };
        table.hash_index.retain(|_, owner| owner != id);

        let tombstone = Tombstone {
            record_id: removed.doc.id,
            collection,
            deleted_at: self.clock.tick(),
        };
        state.tombstones.push(tombstone.clone());
        Ok(Some(tombstone))
    }

    async fn stats(&self, collection: Collection) -> Result<CollectionStats> {
        let state = self.state.read().await;
        let docs: Vec<&Document> = state
            .table(collection)
            .map(|t| t.docs.values().map(|s| &s.doc).collect())
            .unwrap_or_default();

        Ok(CollectionStats {
            record_count: docs.len(),
            last_modified: docs.iter().map(|d| d.updated_at).max(),
            checksum: Self::checksum(docs.into_iter()),
        })
    }

    async fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.tombstones.len();
        state.tombstones.retain(|t| t.deleted_at >= older_than);
        Ok(before - state.tombstones.len())
    }

    fn server_time(&self) -> DateTime<Utc> {
        self.clock.tick()
    }
}
