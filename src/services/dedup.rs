// src/services/dedup.rs

//! Content-addressed deduplication with in-place quality upgrades.
//!
//! A hash lookup decides between reusing the stored record and running
//! extraction again. Re-extraction of an existing record is an upgrade: it
//! keeps the record's id and hash, and is committed with a compare-and-swap
//! against the revision that was read, so of two racing upgrades only one
//! lands and the other gets `ConflictLost`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Config, ContentHash, Record};
use crate::services::retry::ExtractionOutcome;
use crate::storage::{RecordRepository, Versioned};

/// What the caller should do with an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupAction {
    Reuse,
    Reextract,
}

/// Result of a hash lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No record for this hash yet
    Fresh,
    /// Stored record is good enough to hand back as is
    Reuse(Versioned<Record>),
    /// Stored record should be re-extracted in place
    Upgrade(Versioned<Record>),
}

impl Resolution {
    pub fn action(&self) -> DedupAction {
        match self {
            Resolution::Reuse(_) => DedupAction::Reuse,
            Resolution::Fresh | Resolution::Upgrade(_) => DedupAction::Reextract,
        }
    }

    pub fn existing(&self) -> Option<&Record> {
        match self {
            Resolution::Fresh => None,
            Resolution::Reuse(r) | Resolution::Upgrade(r) => Some(&r.value),
        }
    }
}

/// Caller-supplied facts about an upload that are not extracted.
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    pub system_id: Option<String>,
    pub file_name: Option<String>,
    /// When the reading was taken; defaults to server time
    pub taken_at: Option<DateTime<Utc>>,
}

/// Outcome of committing a re-extraction over an existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeOutcome {
    pub record: Versioned<Record>,
    pub previous_score: u8,
    /// Kept score minus previous score
    pub score_delta: i16,
    /// False when the new attempt scored lower and the old fields were kept
    pub replaced: bool,
}

/// Decides reuse vs. re-extraction and commits the results.
pub struct DeduplicationEngine {
    repo: Arc<dyn RecordRepository>,
    upgrade_threshold: u8,
}

impl DeduplicationEngine {
    pub fn new(repo: Arc<dyn RecordRepository>, upgrade_threshold: u8) -> Self {
        Self {
            repo,
            upgrade_threshold,
        }
    }

    pub fn from_config(repo: Arc<dyn RecordRepository>, config: &Config) -> Self {
        Self::new(repo, config.quality.upgrade_threshold)
    }

    pub fn upgrade_threshold(&self) -> u8 {
        self.upgrade_threshold
    }

    /// Look up a hash and classify the stored record, if any.
    pub async fn resolve(&self, hash: &ContentHash) -> Result<Resolution> {
        let resolution = match self.repo.find_by_hash(hash).await? {
            None => Resolution::Fresh,
            Some(found)
                if found.value.validation_score >= self.upgrade_threshold
                    && !found.value.needs_review =>
            {
                Resolution::Reuse(found)
            }
            Some(found) => Resolution::Upgrade(found),
        };

        match &resolution {
            Resolution::Fresh => log::debug!("Dedup miss for {}", hash),
            Resolution::Reuse(r) => log::info!(
                "Dedup hit for {}: reusing {} (score {})",
                hash,
                r.value.id,
                r.value.validation_score
            ),
            Resolution::Upgrade(r) => log::info!(
                "Dedup hit for {}: {} scores {} (review: {}), re-extracting",
                hash,
                r.value.id,
                r.value.validation_score,
                r.value.needs_review
            ),
        }
        Ok(resolution)
    }

    /// Persist the first extraction for a hash.
    ///
    /// Fails with `ConflictLost` if another job stored this hash first.
    pub async fn commit_fresh(
        &self,
        hash: ContentHash,
        meta: UploadMeta,
        outcome: &ExtractionOutcome,
    ) -> Result<Versioned<Record>> {
        let now = self.repo.server_time();
        let record = Record {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: hash,
            system_id: meta.system_id,
            timestamp: meta.taken_at.unwrap_or(now),
            file_name: meta.file_name,
            extracted_fields: outcome.best.fields.clone(),
            validation_score: outcome.score(),
            needs_review: outcome.needs_review(),
            extraction_attempts: outcome.attempts_made,
            updated_at: now,
        };

        let stored = self.repo.insert_record(record).await?;
        log::info!(
            "Stored record {} for {} (score {}, {} attempts)",
            stored.value.id,
            stored.value.content_hash,
            stored.value.validation_score,
            stored.value.extraction_attempts
        );
        Ok(stored)
    }

    /// Commit a re-extraction over the record read by [`Self::resolve`].
    ///
    /// The extracted fields are replaced only when the new attempt scores at
    /// least as well as the stored one; the attempt counter always grows.
    pub async fn commit_upgrade(
        &self,
        expected: &Versioned<Record>,
        outcome: &ExtractionOutcome,
    ) -> Result<UpgradeOutcome> {
        let previous = &expected.value;
        let replaced = outcome.score() >= previous.validation_score;

        let mut next = previous.clone();
        next.extraction_attempts = previous
            .extraction_attempts
            .saturating_add(outcome.attempts_made);
        if replaced {
            next.extracted_fields = outcome.best.fields.clone();
            next.validation_score = outcome.score();
            next.needs_review = outcome.needs_review();
        }

        let record = match self.repo.compare_and_swap(expected, next).await {
            Ok(record) => record,
            Err(e @ AppError::ConflictLost { .. }) => {
                log::warn!("Upgrade of {} lost the race: {}", previous.id, e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let score_delta = record.value.validation_score as i16 - previous.validation_score as i16;
        log::info!(
            "Upgraded {}: score {} -> {} ({})",
            record.value.id,
            previous.validation_score,
            record.value.validation_score,
            if replaced { "replaced" } else { "kept previous fields" }
        );

        Ok(UpgradeOutcome {
            record,
            previous_score: previous.validation_score,
            score_delta,
            replaced,
        })
    }
}
