//! Validation verdicts and the quality report derived from them.

use serde::{Deserialize, Serialize};

/// Output of the validation collaborator for one extraction attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationVerdict {
    pub is_valid: bool,
    #[serde(default)]
    pub critical_errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationVerdict {
    /// A verdict with no findings.
    pub fn clean() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    pub fn with_critical(mut self, message: impl Into<String>) -> Self {
        self.critical_errors.push(message.into());
        self.is_valid = false;
        self
    }

    pub fn with_warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }
}

/// Coarse quality band of a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    /// score >= 70
    Complete,
    /// 50 <= score < 70
    Incomplete,
    /// score < 50
    Critical,
}

/// Numeric quality summary of a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub score: u8,
    pub is_complete: bool,
    pub has_critical_issues: bool,
}

impl QualityReport {
    pub fn class(&self) -> QualityClass {
        match (self.is_complete, self.has_critical_issues) {
            (true, _) => QualityClass::Complete,
            (false, false) => QualityClass::Incomplete,
            (false, true) => QualityClass::Critical,
        }
    }
}
