// src/pipeline/ingest.rs

//! Upload ingestion: hash, dedup, extract, commit.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{Config, ContentHash, Record};
use crate::services::{
    ContentHasher, DedupAction, DeduplicationEngine, ExtractionOutcome, Extractor, ImageInput,
    Resolution, RetryOrchestrator, RetryPolicy, UploadMeta, Validator,
};
use crate::storage::RecordRepository;

/// One uploaded screenshot.
#[derive(Debug, Clone)]
pub struct Upload {
    pub image: ImageInput,
    pub meta: UploadMeta,
}

impl Upload {
    pub fn new(image: ImageInput) -> Self {
        Self {
            image,
            meta: UploadMeta::default(),
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.meta.file_name = Some(name.into());
        self
    }
}

/// What happened to one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub record: Record,
    pub action: DedupAction,
    /// True when an existing record was re-extracted in place
    pub was_upgraded: bool,
    /// Score change of an upgrade
    pub score_delta: Option<i16>,
    /// Extractor calls spent on this upload (0 on reuse)
    pub attempts_made: u32,
}

/// Dedup check input as sent by the upload flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupCheckRequest {
    pub hash: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// Dedup check answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupCheckResponse {
    pub is_duplicate: bool,
    pub action: DedupAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was_upgraded: Option<bool>,
}

/// Runs uploads through dedup and the retry loop.
pub struct IngestPipeline<E, V> {
    hasher: ContentHasher,
    dedup: DeduplicationEngine,
    orchestrator: RetryOrchestrator<E, V>,
    max_concurrent_jobs: usize,
}

impl<E: Extractor, V: Validator> IngestPipeline<E, V> {
    /// Build a pipeline, rejecting a config that could never ingest.
    pub fn new(
        repo: Arc<dyn RecordRepository>,
        extractor: E,
        validator: V,
        config: &Config,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hasher: ContentHasher::new(),
            dedup: DeduplicationEngine::from_config(repo, config),
            orchestrator: RetryOrchestrator::new(
                extractor,
                validator,
                RetryPolicy::from_config(config),
            ),
            max_concurrent_jobs: config.retry.max_concurrent_jobs,
        })
    }

    pub fn dedup(&self) -> &DeduplicationEngine {
        &self.dedup
    }

    /// Ingest one upload.
    ///
    /// A high-quality hit is returned as is. Anything else runs the retry
    /// loop; an existing record is upgraded in place and a losing race
    /// surfaces as `ConflictLost`.
    pub async fn ingest(&self, upload: Upload, cancel: &CancellationToken) -> Result<IngestResult> {
        let hash = self.hasher.hash(&upload.image)?;

        match self.dedup.resolve(&hash).await? {
            Resolution::Reuse(found) => Ok(IngestResult {
                record: found.value,
                action: DedupAction::Reuse,
                was_upgraded: false,
                score_delta: None,
                attempts_made: 0,
            }),
            Resolution::Fresh => {
                let outcome = self.extract(&upload.image, cancel).await?;
                let stored = self.dedup.commit_fresh(hash, upload.meta, &outcome).await?;
                Ok(IngestResult {
                    record: stored.value,
                    action: DedupAction::Reextract,
                    was_upgraded: false,
                    score_delta: None,
                    attempts_made: outcome.attempts_made,
                })
            }
            Resolution::Upgrade(found) => {
                let outcome = self.extract(&upload.image, cancel).await?;
                let upgraded = self.dedup.commit_upgrade(&found, &outcome).await?;
                Ok(IngestResult {
                    record: upgraded.record.value,
                    action: DedupAction::Reextract,
                    was_upgraded: true,
                    score_delta: Some(upgraded.score_delta),
                    attempts_made: outcome.attempts_made,
                })
            }
        }
    }

    async fn extract(&self, image: &ImageInput, cancel: &CancellationToken) -> Result<ExtractionOutcome> {
        self.orchestrator.run(image, cancel).await
    }

    /// Ingest many uploads with bounded parallelism.
    ///
    /// Results come back in input order; one failing or slow upload does
    /// not hold up the others beyond the concurrency limit.
    pub async fn ingest_all(
        &self,
        uploads: Vec<Upload>,
        cancel: &CancellationToken,
    ) -> Vec<Result<IngestResult>> {
        let total = uploads.len();
        let mut indexed: Vec<(usize, Result<IngestResult>)> = stream::iter(uploads.into_iter().enumerate())
            .map(|(index, upload)| async move { (index, self.ingest(upload, cancel).await) })
            .buffer_unordered(self.max_concurrent_jobs)
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        let failures = indexed.iter().filter(|(_, r)| r.is_err()).count();
        if failures > 0 {
            log::warn!("Ingested {} uploads, {} failed", total, failures);
        } else {
            log::info!("Ingested {} uploads", total);
        }
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    /// Answer a dedup check without extracting anything.
    ///
    /// The hash is validated before any store lookup.
    pub async fn check_duplicate(&self, request: &DedupCheckRequest) -> Result<DedupCheckResponse> {
        let hash = ContentHash::parse(&request.hash)?;
        let resolution = self.dedup.resolve(&hash).await?;
        log::debug!(
            "Dedup check for {} ({}): {:?}",
            hash,
            request.file_name.as_deref().unwrap_or("unnamed"),
            resolution.action()
        );

        Ok(DedupCheckResponse {
            is_duplicate: resolution.existing().is_some(),
            action: resolution.action(),
            record_id: resolution.existing().map(|r| r.id.clone()),
            was_upgraded: None,
        })
    }
}

impl From<ContentHash> for DedupCheckRequest {
    fn from(hash: ContentHash) -> Self {
        Self {
            hash: hash.into(),
            file_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Barrier;

    use crate::error::AppError;
    use crate::models::{FieldMap, ValidationVerdict};
    use crate::services::hash_image;
    use crate::storage::MemoryStore;

    /// Extractor that optionally waits at a barrier and counts its calls.
    struct TestExtractor {
        barrier: Option<Barrier>,
        calls: AtomicUsize,
        critical: usize,
    }

    impl TestExtractor {
        fn new(critical: usize) -> Self {
            Self {
                barrier: None,
                calls: AtomicUsize::new(0),
                critical,
            }
        }

        fn gated(parties: usize) -> Self {
            Self {
                barrier: Some(Barrier::new(parties)),
                ..Self::new(0)
            }
        }
    }

    #[async_trait]
    impl Extractor for TestExtractor {
        async fn extract(&self, _image: &ImageInput, _feedback: Option<&str>) -> Result<FieldMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            Ok(json!({"critical": self.critical}).as_object().cloned().unwrap())
        }
    }

    /// Emits as many critical errors as the extractor put in its fields.
    struct FieldValidator;

    impl Validator for FieldValidator {
        fn validate(&self, fields: &FieldMap) -> ValidationVerdict {
            let critical = fields["critical"].as_u64().unwrap_or(0);
            (0..critical).fold(ValidationVerdict::clean(), |v, i| {
                v.with_critical(format!("cell {i} voltage out of range"))
            })
        }
    }

    fn pipeline(repo: Arc<MemoryStore>, extractor: TestExtractor) -> IngestPipeline<TestExtractor, FieldValidator> {
        IngestPipeline::new(repo, extractor, FieldValidator, &Config::default()).unwrap()
    }

    fn upload(bytes: &[u8]) -> Upload {
        Upload::new(ImageInput::Bytes(bytes.to_vec())).with_file_name("bms.png")
    }

    #[tokio::test]
    async fn test_fresh_then_reuse_without_extra_attempts() {
        let repo = Arc::new(MemoryStore::new());
        let pipe = pipeline(repo, TestExtractor::new(0));
        let cancel = CancellationToken::new();

        let first = pipe.ingest(upload(b"img-1"), &cancel).await.unwrap();
        assert_eq!(first.action, DedupAction::Reextract);
        assert_eq!(first.record.validation_score, 100);
        assert_eq!(first.record.extraction_attempts, 1);
        assert_eq!(first.record.file_name.as_deref(), Some("bms.png"));

        let second = pipe.ingest(upload(b"img-1"), &cancel).await.unwrap();
        assert_eq!(second.action, DedupAction::Reuse);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.extraction_attempts, 1);
        assert_eq!(second.attempts_made, 0);
        assert_eq!(pipe.orchestrator_calls(), 1);
    }

    #[tokio::test]
    async fn test_low_quality_record_is_upgraded_in_place() {
        let repo = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        // two criticals: score 60, accepted but below the upgrade gate
        let weak = pipeline(repo.clone(), TestExtractor::new(2));
        let stored = weak.ingest(upload(b"img-2"), &cancel).await.unwrap();
        assert_eq!(stored.record.validation_score, 60);
        assert!(!stored.record.needs_review);

        let strong = pipeline(repo, TestExtractor::new(0));
        let upgraded = strong.ingest(upload(b"img-2"), &cancel).await.unwrap();
        assert!(upgraded.was_upgraded);
        assert_eq!(upgraded.score_delta, Some(40));
        assert_eq!(upgraded.record.id, stored.record.id);
        assert_eq!(upgraded.record.content_hash, stored.record.content_hash);
        assert_eq!(upgraded.record.extraction_attempts, 2);
    }

    #[tokio::test]
    async fn test_concurrent_upgrades_have_one_winner() {
        let repo = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();

        let weak = pipeline(repo.clone(), TestExtractor::new(2));
        let stored = weak.ingest(upload(b"img-3"), &cancel).await.unwrap();

        // both jobs read the record before either extraction finishes
        let racing = pipeline(repo.clone(), TestExtractor::gated(2));
        let (a, b) = tokio::join!(
            racing.ingest(upload(b"img-3"), &cancel),
            racing.ingest(upload(b"img-3"), &cancel)
        );

        let (wins, losses): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
        assert_eq!(wins.len(), 1);
        assert_eq!(losses.len(), 1);
        assert!(losses.into_iter().next().unwrap().unwrap_err().is_conflict());

        let winner = wins.into_iter().next().unwrap().unwrap();
        assert!(winner.was_upgraded);

        let hash = hash_image(&ImageInput::Bytes(b"img-3".to_vec())).unwrap();
        let current = repo.find_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(current.value, winner.record);
        assert_eq!(current.value.id, stored.record.id);
        assert_eq!(current.value.extraction_attempts, 2);
        assert_eq!(current.revision, 2);
    }

    #[tokio::test]
    async fn test_concurrent_fresh_ingest_keeps_one_record() {
        let repo = Arc::new(MemoryStore::new());
        let racing = pipeline(repo.clone(), TestExtractor::gated(2));
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            racing.ingest(upload(b"img-4"), &cancel),
            racing.ingest(upload(b"img-4"), &cancel)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let stats = repo.stats(crate::models::Collection::History).await.unwrap();
        assert_eq!(stats.record_count, 1);
    }

    #[tokio::test]
    async fn test_ingest_all_runs_jobs_in_parallel() {
        let repo = Arc::new(MemoryStore::new());
        // a barrier of two only opens if two jobs are in flight at once
        let pipe = pipeline(repo, TestExtractor::gated(2));
        let cancel = CancellationToken::new();

        let uploads = vec![upload(b"a"), upload(b"b")];
        let results = tokio::time::timeout(Duration::from_secs(5), pipe.ingest_all(uploads, &cancel))
            .await
            .expect("jobs ran one at a time");
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_ingest_all_keeps_order_and_isolates_failures() {
        let repo = Arc::new(MemoryStore::new());
        let pipe = pipeline(repo, TestExtractor::new(0));
        let cancel = CancellationToken::new();

        let uploads = vec![
            upload(b"first"),
            Upload::new(ImageInput::Encoded("!!! not base64 !!!".into())),
            upload(b"third"),
        ];
        let results = pipe.ingest_all(uploads, &cancel).await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(AppError::InvalidInput(_))));
        let third = results[2].as_ref().unwrap();
        let expected = hash_image(&ImageInput::Bytes(b"third".to_vec())).unwrap();
        assert_eq!(third.record.content_hash, expected);
    }

    #[tokio::test]
    async fn test_check_duplicate() {
        let repo = Arc::new(MemoryStore::new());
        let pipe = pipeline(repo, TestExtractor::new(0));
        let cancel = CancellationToken::new();

        let bad = DedupCheckRequest {
            hash: "ABC".into(),
            file_name: None,
        };
        assert!(matches!(
            pipe.check_duplicate(&bad).await,
            Err(AppError::InvalidInput(_))
        ));
        let upper = DedupCheckRequest {
            hash: "A".repeat(64),
            file_name: None,
        };
        assert!(pipe.check_duplicate(&upper).await.is_err());

        let hash = hash_image(&ImageInput::Bytes(b"img-5".to_vec())).unwrap();
        let miss = pipe.check_duplicate(&hash.clone().into()).await.unwrap();
        assert!(!miss.is_duplicate);
        assert_eq!(miss.action, DedupAction::Reextract);
        assert!(miss.record_id.is_none());

        let stored = pipe.ingest(upload(b"img-5"), &cancel).await.unwrap();
        let hit = pipe.check_duplicate(&hash.into()).await.unwrap();
        assert!(hit.is_duplicate);
        assert_eq!(hit.action, DedupAction::Reuse);
        assert_eq!(hit.record_id, Some(stored.record.id));

        let wire = serde_json::to_value(&hit).unwrap();
        assert_eq!(wire["isDuplicate"], json!(true));
        assert_eq!(wire["action"], json!("reuse"));
        assert!(wire.get("wasUpgraded").is_none());
    }

    #[test]
    fn test_new_rejects_unusable_config() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        let built = IngestPipeline::new(
            Arc::new(MemoryStore::new()),
            TestExtractor::new(0),
            FieldValidator,
            &config,
        );
        assert!(matches!(built, Err(AppError::Validation(_))));
    }

    impl IngestPipeline<TestExtractor, FieldValidator> {
        fn orchestrator_calls(&self) -> usize {
            self.orchestrator.extractor().calls.load(Ordering::SeqCst)
        }
    }
}
