//! Service layer of the consistency core.
//!
//! This module contains the business logic for:
//! - Content addressing (`ContentHasher`)
//! - Quality scoring (`QualityScorer`)
//! - The extraction retry loop (`RetryOrchestrator`)
//! - Deduplication and in-place upgrades (`DeduplicationEngine`)
//! - The server side of sync (`SyncCoordinator`)

pub mod dedup;
pub mod feedback;
pub mod hasher;
pub mod quality;
pub mod retry;
pub mod sync;

pub use dedup::{DedupAction, DeduplicationEngine, Resolution, UpgradeOutcome, UploadMeta};
pub use feedback::{ErrorCategory, build_feedback};
pub use hasher::{ContentHasher, ImageInput, hash_image};
pub use quality::{QualityScorer, score_verdict};
pub use retry::{
    Attempt, AttemptLog, ExtractionOutcome, Extractor, JobState, RetryOrchestrator, RetryPolicy,
    Validator,
};
pub use sync::{PullResponse, PushRequest, PushResponse, SyncCoordinator, SyncMetadata};
