// src/services/retry.rs

//! Bounded, self-correcting extraction loop.
//!
//! Each job runs up to `max_attempts` extractor calls. After every call the
//! verdict is scored; an attempt at or above the acceptance threshold ends
//! the job. Otherwise the verdict is turned into feedback for the next call.
//! When attempts or wall-clock budget run out, the highest-scoring attempt
//! seen (latest on ties) is returned flagged for review.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{Config, FieldMap, QualityReport, ValidationVerdict};
use crate::services::feedback::build_feedback;
use crate::services::hasher::ImageInput;
use crate::services::quality::QualityScorer;

/// Vision-model collaborator.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extract raw fields, optionally steered by correction feedback.
    async fn extract(&self, image: &ImageInput, feedback: Option<&str>) -> Result<FieldMap>;
}

/// Physics/consistency validation collaborator.
pub trait Validator: Send + Sync {
    fn validate(&self, fields: &FieldMap) -> ValidationVerdict;
}

/// Lifecycle of one extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Extracting,
    Validating,
    Retrying,
    Accepted,
    Exhausted,
}

/// Limits for one job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub acceptance_threshold: u8,
    pub attempt_timeout: Duration,
    pub total_budget: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry.max_attempts,
            acceptance_threshold: config.quality.acceptance_threshold,
            attempt_timeout: config.retry.attempt_timeout(),
            total_budget: config.retry.total_budget(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One scored extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub number: u32,
    pub fields: FieldMap,
    pub verdict: ValidationVerdict,
    pub quality: QualityReport,
}

/// What happened on each attempt, for logs and callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AttemptLog {
    Scored { number: u32, score: u8 },
    TimedOut { number: u32 },
    Failed { number: u32, error: String },
}

/// Final result of a job.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    /// The attempt kept as the job's result
    pub best: Attempt,
    /// `Accepted` or `Exhausted`
    pub state: JobState,
    /// Extractor calls made, including timed-out and failed ones
    pub attempts_made: u32,
    pub history: Vec<AttemptLog>,
}

impl ExtractionOutcome {
    pub fn score(&self) -> u8 {
        self.best.quality.score
    }

    pub fn needs_review(&self) -> bool {
        self.state != JobState::Accepted
    }
}

/// Keep whichever attempt scores higher; the later one wins ties.
fn keep_best(best: Option<Attempt>, candidate: Attempt) -> Attempt {
    match best {
        Some(current) if current.quality.score > candidate.quality.score => current,
        _ => candidate,
    }
}

/// Drives the extract/validate/retry state machine.
pub struct RetryOrchestrator<E, V> {
    extractor: E,
    validator: V,
    scorer: QualityScorer,
    policy: RetryPolicy,
}

impl<E: Extractor, V: Validator> RetryOrchestrator<E, V> {
    pub fn new(extractor: E, validator: V, policy: RetryPolicy) -> Self {
        Self {
            extractor,
            validator,
            scorer: QualityScorer::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    fn accepts(&self, quality: &QualityReport) -> bool {
        quality.score >= self.policy.acceptance_threshold && !quality.has_critical_issues
    }

    fn transition(number: u32, state: JobState) {
        log::debug!("Extraction attempt {}: {:?}", number, state);
    }

    /// Run one job to completion.
    ///
    /// Errors only when the input is rejected by the extractor, the token
    /// is cancelled, or no attempt produced a scored result in budget.
    pub async fn run(
        &self,
        image: &ImageInput,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutcome> {
        let max = self.policy.max_attempts;
        let deadline = Instant::now() + self.policy.total_budget;

        let mut best: Option<Attempt> = None;
        let mut last_verdict: Option<ValidationVerdict> = None;
        let mut history = Vec::with_capacity(max as usize);
        let mut attempts_made = 0;

        for number in 1..=max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "Extraction budget of {:?} spent after {} attempts",
                    self.policy.total_budget,
                    attempts_made
                );
                break;
            }

            let feedback = last_verdict
                .as_ref()
                .map(|verdict| build_feedback(number, max, verdict));
            if feedback.is_some() {
                Self::transition(number, JobState::Retrying);
            }
            Self::transition(number, JobState::Extracting);
            attempts_made = number;

            let limit = remaining.min(self.policy.attempt_timeout);
            let call = self.extractor.extract(image, feedback.as_deref());
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                result = tokio::time::timeout(limit, call) => result,
            };

            let fields = match result {
                Ok(Ok(fields)) => fields,
                Ok(Err(e @ AppError::InvalidInput(_))) => return Err(e),
                Ok(Err(e)) => {
                    log::warn!("Extraction attempt {}/{} failed: {}", number, max, e);
                    history.push(AttemptLog::Failed {
                        number,
                        error: e.to_string(),
                    });
                    continue;
                }
                Err(_) => {
                    log::warn!(
                        "Extraction attempt {}/{} timed out after {:?}",
                        number,
                        max,
                        limit
                    );
                    history.push(AttemptLog::TimedOut { number });
                    continue;
                }
            };

            Self::transition(number, JobState::Validating);
            let verdict = self.validator.validate(&fields);
            let quality = self.scorer.score(&verdict);
            history.push(AttemptLog::Scored {
                number,
                score: quality.score,
            });
            log::info!(
                "Extraction attempt {}/{} scored {} ({} critical, {} warnings)",
                number,
                max,
                quality.score,
                verdict.critical_errors.len(),
                verdict.warnings.len()
            );

            let attempt = Attempt {
                number,
                fields,
                verdict: verdict.clone(),
                quality,
            };

            if self.accepts(&quality) {
                Self::transition(number, JobState::Accepted);
                return Ok(ExtractionOutcome {
                    best: attempt,
                    state: JobState::Accepted,
                    attempts_made,
                    history,
                });
            }

            best = Some(keep_best(best, attempt));
            last_verdict = Some(verdict);
        }

        match best {
            Some(best) => {
                log::warn!(
                    "Extraction exhausted: keeping attempt {} with score {} for review",
                    best.number,
                    best.quality.score
                );
                Ok(ExtractionOutcome {
                    best,
                    state: JobState::Exhausted,
                    attempts_made,
                    history,
                })
            }
            None => Err(AppError::ExtractionFailed(format!(
                "no usable attempt out of {attempts_made}"
            ))),
        }
    }
}
