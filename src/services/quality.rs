// src/services/quality.rs

//! Linear penalty model turning a validation verdict into a score.
//!
//! The weights and bands are fixed: the retry acceptance gate and the dedup
//! upgrade gate are tuned against them.

use crate::models::{QualityReport, ValidationVerdict};

/// Points deducted per critical error.
pub const CRITICAL_PENALTY: u32 = 20;
/// Points deducted per warning.
pub const WARNING_PENALTY: u32 = 5;
/// Minimum score considered complete.
pub const COMPLETE_THRESHOLD: u8 = 70;
/// Scores below this carry critical issues.
pub const CRITICAL_THRESHOLD: u8 = 50;

/// Scores validation verdicts.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityScorer;

impl QualityScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score a verdict: 100 minus penalties, floored at 0.
    pub fn score(&self, verdict: &ValidationVerdict) -> QualityReport {
        let penalty = (verdict.critical_errors.len() as u32)
            .saturating_mul(CRITICAL_PENALTY)
            .saturating_add((verdict.warnings.len() as u32).saturating_mul(WARNING_PENALTY));
        let score = 100u32.saturating_sub(penalty) as u8;

        QualityReport {
            score,
            is_complete: score >= COMPLETE_THRESHOLD,
            has_critical_issues: score < CRITICAL_THRESHOLD,
        }
    }
}

/// Convenience function to score a verdict.
pub fn score_verdict(verdict: &ValidationVerdict) -> QualityReport {
    QualityScorer::new().score(verdict)
}
