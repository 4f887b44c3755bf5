//! Client sync driver.
//!
//! One cycle per collection: drain the pending queue oldest first, then
//! pull until the server reports nothing more. Cycles for the same
//! collection never overlap; a second caller gets `SyncInProgress`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::cache::{LocalCache, SyncTransport};
use crate::error::{AppError, Result};
use crate::models::{CacheConfig, Collection, Config};
use crate::utils::time;

/// What one sync cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub conflicts: usize,
    pub pulled: usize,
    pub purged: usize,
    pub pages: usize,
    pub full_resync: bool,
}

/// Marks a collection busy until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Collection>>,
    collection: Collection,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<Collection>>, collection: Collection) -> Result<Self> {
        let mut busy = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !busy.insert(collection) {
            return Err(AppError::SyncInProgress {
                collection: collection.to_string(),
            });
        }
        Ok(Self { set, collection })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut busy = self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        busy.remove(&self.collection);
    }
}

/// Await `fut` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = fut => result,
    }
}

/// Keeps a [`LocalCache`] in step with the server.
pub struct SyncClient<T> {
    cache: Arc<LocalCache>,
    transport: T,
    push_batch_size: usize,
    refresh_ttl: Duration,
    in_flight: Mutex<HashSet<Collection>>,
}

impl<T: SyncTransport> SyncClient<T> {
    pub fn new(cache: Arc<LocalCache>, transport: T, push_batch_size: usize) -> Self {
        Self {
            cache,
            transport,
            push_batch_size: push_batch_size.max(1),
            refresh_ttl: CacheConfig::default().ttl(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(cache: Arc<LocalCache>, transport: T, config: &Config) -> Self {
        Self {
            refresh_ttl: config.cache.ttl(),
            ..Self::new(cache, transport, config.sync.push_batch_size)
        }
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    /// Run one push-then-pull cycle for a collection.
    ///
    /// On error or cancellation, unacknowledged changes stay pending and the
    /// cursor stays at the last fully applied page.
    pub async fn sync_collection(
        &self,
        collection: Collection,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let _guard = InFlight::acquire(&self.in_flight, collection)?;
        let mut report = SyncReport::default();

        self.push_pending(collection, cancel, &mut report).await?;

        let since = self.cache.cursor(collection).await.unwrap_or(DateTime::UNIX_EPOCH);
        self.pull_from(collection, since, cancel, &mut report).await?;

        if self.cache.pending_count(collection).await == 0 {
            let meta = cancellable(cancel, self.transport.metadata(collection)).await?;
            let local = self.cache.count(collection).await;
            if meta.record_count != local {
                log::warn!(
                    "{}: {} rows cached but server has {}, running full resync",
                    collection,
                    local,
                    meta.record_count
                );
                self.cache.reset_cursor(collection).await?;
                report.full_resync = true;
                self.pull_from(collection, DateTime::UNIX_EPOCH, cancel, &mut report)
                    .await?;
            }
        }

        log::info!(
            "Synced {}: pushed {}, {} conflicts, pulled {} in {} pages, purged {}",
            collection,
            report.pushed,
            report.conflicts,
            report.pulled,
            report.pages,
            report.purged
        );
        Ok(report)
    }

    /// Sync before a read, but only when the last sync is older than the
    /// refresh TTL. Returns `None` when the cache was fresh enough.
    pub async fn refresh_if_stale(
        &self,
        collection: Collection,
        cancel: &CancellationToken,
    ) -> Result<Option<SyncReport>> {
        if !self
            .cache
            .needs_refresh(collection, self.refresh_ttl, Utc::now())
            .await
        {
            return Ok(None);
        }
        self.sync_collection(collection, cancel).await.map(Some)
    }

    /// Sync every collection in turn.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<Vec<(Collection, SyncReport)>> {
        let mut reports = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            reports.push((collection, self.sync_collection(collection, cancel).await?));
        }
        Ok(reports)
    }

    async fn push_pending(
        &self,
        collection: Collection,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        let pending = self.cache.pending_changes(collection).await;
        if pending.is_empty() {
            return Ok(());
        }
        log::debug!("{}: pushing {} pending changes", collection, pending.len());

        for chunk in pending.chunks(self.push_batch_size) {
            let items = chunk.iter().map(|c| c.doc.clone().into_value()).collect();
            let response = cancellable(cancel, self.transport.push(collection, items)).await?;

            let acks: Vec<(String, u64)> = {
                let conflicted: HashSet<&str> =
                    response.conflicts.iter().map(|c| c.id.as_str()).collect();
                chunk
                    .iter()
                    .filter(|c| !conflicted.contains(c.doc.id.as_str()))
                    .map(|c| (c.doc.id.clone(), c.local_rev))
                    .collect()
            };

            report.pushed += self.cache.acknowledge(collection, &acks).await?;
            for conflict in response.conflicts {
                log::warn!(
                    "{}/{} rejected by server ({}), adopting server copy",
                    collection,
                    conflict.id,
                    conflict.reason
                );
                self.cache
                    .adopt_server_copy(collection, &conflict.id, conflict.current)
                    .await?;
                report.conflicts += 1;
            }
        }
        Ok(())
    }

    async fn pull_from(
        &self,
        collection: Collection,
        mut since: DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        loop {
            let watermark = time::format_utc(&since);
            let page = cancellable(cancel, self.transport.pull(collection, &watermark)).await?;
            report.pages += 1;

            let next = time::parse_utc(&page.timestamp)?;
            let applied = self
                .cache
                .upsert_from_server(collection, page.items, &page.deleted)
                .await?;
            report.pulled += applied.applied;
            report.purged += applied.purged;
            self.cache.advance_cursor(collection, next).await?;

            if !page.has_more {
                return Ok(());
            }
            if next <= since {
                return Err(AppError::validation(format!(
                    "pull of {collection} did not advance past {watermark}"
                )));
            }
            since = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalTransport;
    use crate::models::{Document, SyncStatus};
    use crate::services::{PullResponse, PushResponse, SyncCoordinator, SyncMetadata};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server(page_size: usize) -> Arc<SyncCoordinator> {
        Arc::new(SyncCoordinator::new(Arc::new(MemoryStore::new()), page_size))
    }

    fn client(coordinator: &Arc<SyncCoordinator>, batch: usize) -> SyncClient<LocalTransport> {
        SyncClient::new(
            Arc::new(LocalCache::in_memory()),
            LocalTransport::new(coordinator.clone()),
            batch,
        )
    }

    fn doc(id: &str, ts: &str) -> Document {
        Document::new(id, time::parse_utc(ts).unwrap()).with_field("name", id)
    }

    #[tokio::test]
    async fn test_offline_changes_drain_then_pull() {
        let coordinator = server(100);
        let alice = client(&coordinator, 2);
        let bob = client(&coordinator, 2);
        let cancel = CancellationToken::new();

        for i in 0..5 {
            alice
                .cache()
                .enqueue_local_change(Collection::Systems, doc(&format!("s{i}"), "2024-01-01T00:00:00Z"))
                .await
                .unwrap();
        }
        let report = alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(report.pushed, 5);
        assert_eq!(report.conflicts, 0);
        assert_eq!(alice.cache().pending_count(Collection::Systems).await, 0);
        // the pull sees alice's own writes with server timestamps
        assert_eq!(report.pulled, 5);
        assert!(!report.full_resync);

        let report = bob.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(report.pulled, 5);
        let s0 = bob.cache().get(Collection::Systems, "s0").await.unwrap();
        assert_eq!(s0.sync_status, SyncStatus::Synced);

        let again = bob.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(again.pulled, 0);
    }

    #[tokio::test]
    async fn test_deletions_reach_client() {
        let coordinator = server(100);
        let alice = client(&coordinator, 10);
        let cancel = CancellationToken::new();

        coordinator
            .push(
                Collection::Systems,
                vec![
                    json!({"id": "keep", "updatedAt": "2024-01-01T00:00:00Z"}),
                    json!({"id": "drop", "updatedAt": "2024-01-01T00:00:00Z"}),
                ],
            )
            .await
            .unwrap();
        alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(alice.cache().count(Collection::Systems).await, 2);

        coordinator.delete_record(Collection::Systems, "drop").await.unwrap();
        let report = alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(report.purged, 1);
        assert!(alice.cache().get(Collection::Systems, "drop").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_local_change_adopts_server_copy() {
        let coordinator = server(100);
        let alice = client(&coordinator, 10);
        let cancel = CancellationToken::new();

        coordinator
            .push(
                Collection::Systems,
                vec![json!({"id": "s1", "updatedAt": "2024-06-01T00:00:00Z", "name": "server"})],
            )
            .await
            .unwrap();
        alice
            .cache()
            .enqueue_local_change(
                Collection::Systems,
                doc("s1", "2024-01-01T00:00:00Z").with_field("name", "offline edit"),
            )
            .await
            .unwrap();

        let report = alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(report.conflicts, 1);
        let s1 = alice.cache().get(Collection::Systems, "s1").await.unwrap();
        assert_eq!(s1.sync_status, SyncStatus::Synced);
        assert_eq!(s1.doc.field("name"), Some(&json!("server")));
    }

    #[tokio::test]
    async fn test_paged_pull_advances_cursor() {
        let coordinator = server(2);
        let alice = client(&coordinator, 10);
        let cancel = CancellationToken::new();

        let items: Vec<Value> = (0..5)
            .map(|i| json!({"id": format!("s{i}"), "updatedAt": "2024-01-01T00:00:00Z"}))
            .collect();
        coordinator.push(Collection::Systems, items).await.unwrap();

        let report = alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(report.pulled, 5);
        assert_eq!(report.pages, 3);
        assert!(alice.cache().cursor(Collection::Systems).await.is_some());
    }

    #[tokio::test]
    async fn test_count_mismatch_triggers_full_resync() {
        let coordinator = server(100);
        let alice = client(&coordinator, 10);
        let cancel = CancellationToken::new();

        coordinator
            .push(
                Collection::Systems,
                vec![json!({"id": "s1", "updatedAt": "2024-01-01T00:00:00Z"})],
            )
            .await
            .unwrap();
        alice.sync_collection(Collection::Systems, &cancel).await.unwrap();

        // a row the server no longer knows about, e.g. after tombstone purge
        alice
            .cache()
            .upsert_from_server(Collection::Systems, vec![doc("ghost", "2024-01-01T00:00:00Z")], &[])
            .await
            .unwrap();

        let report = alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert!(report.full_resync);
        assert_eq!(alice.cache().count(Collection::Systems).await, 1);
        assert!(alice.cache().get(Collection::Systems, "ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_only_when_stale() {
        let coordinator = server(100);
        let alice = SyncClient::from_config(
            Arc::new(LocalCache::in_memory()),
            LocalTransport::new(coordinator.clone()),
            &Config::default(),
        );
        let cancel = CancellationToken::new();

        let first = alice.refresh_if_stale(Collection::History, &cancel).await.unwrap();
        assert!(first.is_some());
        let second = alice.refresh_if_stale(Collection::History, &cancel).await.unwrap();
        assert!(second.is_none());
    }

    /// Forwards to a local coordinator and records the ids of every push.
    struct RecordingTransport {
        inner: LocalTransport,
        pushed: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl SyncTransport for RecordingTransport {
        async fn metadata(&self, collection: Collection) -> Result<SyncMetadata> {
            self.inner.metadata(collection).await
        }

        async fn pull(&self, collection: Collection, since: &str) -> Result<PullResponse> {
            self.inner.pull(collection, since).await
        }

        async fn push(&self, collection: Collection, items: Vec<Value>) -> Result<PushResponse> {
            let ids = items
                .iter()
                .filter_map(|item| item["id"].as_str().map(String::from))
                .collect();
            self.pushed.lock().unwrap().push(ids);
            self.inner.push(collection, items).await
        }
    }

    #[tokio::test]
    async fn test_push_drains_in_enqueue_order_across_chunks() {
        let coordinator = server(100);
        let alice = SyncClient::new(
            Arc::new(LocalCache::in_memory()),
            RecordingTransport {
                inner: LocalTransport::new(coordinator.clone()),
                pushed: Mutex::new(Vec::new()),
            },
            2,
        );
        let cancel = CancellationToken::new();

        for id in ["s3", "s1", "s4", "s0", "s2"] {
            alice
                .cache()
                .enqueue_local_change(Collection::Systems, doc(id, "2024-01-01T00:00:00Z"))
                .await
                .unwrap();
        }
        // editing a queued row keeps its original place
        alice
            .cache()
            .enqueue_local_change(Collection::Systems, doc("s1", "2024-01-02T00:00:00Z"))
            .await
            .unwrap();

        let report = alice.sync_collection(Collection::Systems, &cancel).await.unwrap();
        assert_eq!(report.pushed, 5);

        let pushed = alice.transport.pushed.lock().unwrap().clone();
        assert_eq!(
            pushed,
            vec![
                vec!["s3".to_string(), "s1".to_string()],
                vec!["s4".to_string(), "s0".to_string()],
                vec!["s2".to_string()],
            ]
        );
    }

    /// Transport whose pushes hang until cancelled, counting calls.
    struct HangingTransport {
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl SyncTransport for HangingTransport {
        async fn metadata(&self, _collection: Collection) -> Result<SyncMetadata> {
            Err(AppError::transient("offline"))
        }

        async fn pull(&self, _collection: Collection, _since: &str) -> Result<PullResponse> {
            Err(AppError::transient("offline"))
        }

        async fn push(&self, _collection: Collection, _items: Vec<Value>) -> Result<PushResponse> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_overlapping_cycles_refused_and_cancel_keeps_pending() {
        let cache = Arc::new(LocalCache::in_memory());
        cache
            .enqueue_local_change(Collection::History, doc("r1", "2024-01-01T00:00:00Z"))
            .await
            .unwrap();
        let client = Arc::new(SyncClient::new(
            cache.clone(),
            HangingTransport {
                pushes: AtomicUsize::new(0),
            },
            10,
        ));
        let cancel = CancellationToken::new();

        let running = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.sync_collection(Collection::History, &cancel).await })
        };
        while client.transport.pushes.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = client
            .sync_collection(Collection::History, &CancellationToken::new())
            .await;
        assert!(matches!(second, Err(AppError::SyncInProgress { .. })));

        cancel.cancel();
        let first = running.await.unwrap();
        assert!(matches!(first, Err(AppError::Cancelled)));
        assert_eq!(cache.pending_count(Collection::History).await, 1);

        // the guard is released: a fresh cycle gets past it and stops at its own token
        let stopped = CancellationToken::new();
        stopped.cancel();
        let third = client.sync_collection(Collection::History, &stopped).await;
        assert!(matches!(third, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn test_offline_pull_keeps_cursor() {
        let cache = Arc::new(LocalCache::in_memory());
        let client = SyncClient::new(
            cache.clone(),
            HangingTransport {
                pushes: AtomicUsize::new(0),
            },
            10,
        );
        let err = client
            .sync_collection(Collection::Systems, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.cursor(Collection::Systems).await.is_none());
    }
}
