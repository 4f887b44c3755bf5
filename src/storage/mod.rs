//! Storage abstractions for the server of record.
//!
//! The core only talks to a narrow repository: hash lookup, compare-and-swap
//! on a single record, bulk upsert for pushes, and change/tombstone feeds for
//! pulls. Backends decide how to make those atomic.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-process tables behind one `RwLock`
//! - [`LocalStorage`]: the memory store plus an atomic JSON snapshot on disk

pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Collection, ContentHash, Document, Record, Tombstone};
use crate::utils::time;

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::MemoryStore;

/// A value together with the store revision it was read at.
///
/// Writers hand the whole thing back to [`RecordRepository::compare_and_swap`];
/// the write only lands if the revision is still current.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: u64,
}

/// One page of an incremental pull.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Live documents with `updated_at >= since`, oldest first
    pub items: Vec<Document>,
    /// Ids deleted at or after `since`
    pub deleted: Vec<String>,
    /// Watermark for the next pull
    pub timestamp: DateTime<Utc>,
    /// More items remain past `timestamp`
    pub has_more: bool,
}

/// An item refused by a bulk upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: String,
    pub reason: String,
    /// Server copy the client should adopt, if one exists
    #[serde(default)]
    pub current: Option<Document>,
}

/// Outcome of a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub conflicts: Vec<SyncConflict>,
    pub server_time: DateTime<Utc>,
}

/// Summary of a collection for the metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub record_count: usize,
    pub last_modified: Option<DateTime<Utc>>,
    pub checksum: String,
}

/// Repository of records, documents and tombstones.
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// O(1) lookup of the history record owning a content hash.
    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Versioned<Record>>>;

    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Versioned<Document>>>;

    /// Insert a brand-new history record.
    ///
    /// Fails with `ConflictLost` if its hash or id is already taken.
    async fn insert_record(&self, record: Record) -> Result<Versioned<Record>>;

    /// Replace a history record if it is still at `expected.revision`.
    ///
    /// Fails with `ConflictLost` if another writer got there first.
    async fn compare_and_swap(
        &self,
        expected: &Versioned<Record>,
        next: Record,
    ) -> Result<Versioned<Record>>;

    /// Apply a pushed batch as one atomic, last-writer-wins upsert.
    async fn bulk_upsert(
        &self,
        collection: Collection,
        items: Vec<Document>,
    ) -> Result<BulkUpsertReport>;

    /// Live changes and deletions at or after `since`.
    async fn changes_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<ChangeSet>;

    async fn tombstones_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
    ) -> Result<Vec<Tombstone>>;

    /// Remove a document and record its tombstone.
    async fn delete(&self, collection: Collection, id: &str) -> Result<Option<Tombstone>>;

    async fn stats(&self, collection: Collection) -> Result<CollectionStats>;

    /// Drop tombstones deleted before `older_than`; returns how many.
    async fn purge_tombstones(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Current server time (monotonic).
    fn server_time(&self) -> DateTime<Utc>;
}

/// A stored document with its concurrency bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredDocument {
    pub doc: Document,
    pub revision: u64,
    /// Writer-supplied time of the last accepted write (last-writer-wins)
    #[serde(with = "time::flexible")]
    pub writer_clock: DateTime<Utc>,
}
