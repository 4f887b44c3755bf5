// src/services/sync.rs

//! Server side of the incremental sync protocol.
//!
//! Three collection-scoped operations: metadata, an incremental change feed
//! keyed by a `since` watermark, and a batched last-writer-wins push. Every
//! timestamp leaving this module is rendered as `YYYY-MM-DDTHH:MM:SS.mmmZ`,
//! whatever the store holds internally.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{Collection, Config, Document, Tombstone};
use crate::storage::{RecordRepository, SyncConflict};
use crate::utils::time;

/// Response of `GET /sync/{collection}/metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub collection: Collection,
    /// `updatedAt` of the most recently changed live document
    pub last_modified: Option<String>,
    pub record_count: usize,
    pub checksum: String,
    pub server_time: String,
}

/// Response of an incremental pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub items: Vec<Document>,
    pub deleted: Vec<String>,
    /// Watermark to send as `since` on the next pull
    pub timestamp: String,
    pub has_more: bool,
}

/// Body of `POST /sync/{collection}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub collection: Collection,
    pub items: Vec<Value>,
}

/// Response of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    pub inserted: usize,
    pub updated: usize,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    pub server_time: String,
}

/// Serves metadata, pulls and pushes over a repository.
pub struct SyncCoordinator {
    repo: Arc<dyn RecordRepository>,
    page_size: usize,
}

impl SyncCoordinator {
    pub fn new(repo: Arc<dyn RecordRepository>, page_size: usize) -> Self {
        Self {
            repo,
            page_size: page_size.max(1),
        }
    }

    pub fn from_config(repo: Arc<dyn RecordRepository>, config: &Config) -> Self {
        Self::new(repo, config.sync.page_size)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub async fn get_metadata(&self, collection: Collection) -> Result<SyncMetadata> {
        let stats = self.repo.stats(collection).await?;
        Ok(SyncMetadata {
            collection,
            last_modified: stats.last_modified.as_ref().map(time::format_utc),
            record_count: stats.record_count,
            checksum: stats.checksum,
            server_time: time::format_utc(&self.repo.server_time()),
        })
    }

    /// Incremental pull with a watermark as sent on the wire.
    ///
    /// A missing or blank `since` is refused rather than treated as a full
    /// pull; clients that want everything send the Unix epoch explicitly.
    pub async fn pull_incremental(
        &self,
        collection: Collection,
        since: Option<&str>,
    ) -> Result<PullResponse> {
        let since = match since.map(str::trim) {
            Some(text) if !text.is_empty() => time::parse_utc(text)?,
            _ => return Err(AppError::watermark_missing(collection)),
        };
        self.pull_since(collection, since).await
    }

    /// Incremental pull with an already parsed watermark.
    pub async fn pull_since(
        &self,
        collection: Collection,
        since: DateTime<Utc>,
    ) -> Result<PullResponse> {
        let changes = self
            .repo
            .changes_since(collection, since, self.page_size)
            .await?;

        log::debug!(
            "Pull {} since {}: {} items, {} deleted, more: {}",
            collection,
            time::format_utc(&since),
            changes.items.len(),
            changes.deleted.len(),
            changes.has_more
        );

        Ok(PullResponse {
            items: changes.items,
            deleted: changes.deleted,
            timestamp: time::format_utc(&changes.timestamp),
            has_more: changes.has_more,
        })
    }

    /// Apply a pushed batch.
    ///
    /// Every item is parsed before anything is written; one malformed item
    /// rejects the whole batch with `InvalidInput`.
    pub async fn push(&self, collection: Collection, items: Vec<Value>) -> Result<PushResponse> {
        let docs = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                Document::from_value(item).map_err(|e| {
                    AppError::invalid_input(format!("push item {i} is malformed: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let count = docs.len();
        let report = self.repo.bulk_upsert(collection, docs).await?;

        log::info!(
            "Push {}: {} items, {} inserted, {} updated, {} conflicts",
            collection,
            count,
            report.inserted,
            report.updated,
            report.conflicts.len()
        );

        Ok(PushResponse {
            success: true,
            inserted: report.inserted,
            updated: report.updated,
            conflicts: report.conflicts,
            server_time: time::format_utc(&report.server_time),
        })
    }

    /// Handle a push body, checking it targets the addressed collection.
    pub async fn push_request(
        &self,
        collection: Collection,
        request: PushRequest,
    ) -> Result<PushResponse> {
        if request.collection != collection {
            return Err(AppError::invalid_input(format!(
                "push body names '{}' but was sent to '{}'",
                request.collection, collection
            )));
        }
        self.push(collection, request.items).await
    }

    /// Admin deletion: remove a document and leave a tombstone behind.
    pub async fn delete_record(&self, collection: Collection, id: &str) -> Result<Option<Tombstone>> {
        let tombstone = self.repo.delete(collection, id).await?;
        match &tombstone {
            Some(_) => log::info!("Deleted {}/{}", collection, id),
            None => log::debug!("Delete of {}/{}: not found", collection, id),
        }
        Ok(tombstone)
    }

    /// Drop tombstones older than `retention`.
    pub async fn purge_tombstones(&self, retention: TimeDelta) -> Result<usize> {
        let cutoff = self.repo.server_time() - retention;
        let purged = self.repo.purge_tombstones(cutoff).await?;
        if purged > 0 {
            log::info!(
                "Purged {} tombstones deleted before {}",
                purged,
                time::format_utc(&cutoff)
            );
        }
        Ok(purged)
    }
}
