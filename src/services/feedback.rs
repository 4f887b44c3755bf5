// src/services/feedback.rs

//! Correction hints fed back to the extractor between attempts.

use std::fmt::Write;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::ValidationVerdict;

static STATISTICAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(max(imum)?|min(imum)?|highest|lowest|average|avg|mean|spread|delta|difference)\b")
        .expect("static regex")
});

static CROSS_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bsum\b|\bpower\b|[vV]\s*[x×*]\s*[iI]\b|voltage\s*[x×*]\s*current|does not match|mismatch|inconsistent)")
        .expect("static regex")
});

static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(out of range|outside|exceeds|must be between|greater than|less than|\bbelow\b|\babove\b|negative|[<>]=?\s*-?\d)")
        .expect("static regex")
});

/// Shape of a critical validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Single value outside its physical range
    Range,
    /// Two or more fields violate a physical relation
    CrossField,
    /// Reported aggregate disagrees with computed one
    Statistical,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Classify an error message by its wording.
    pub fn classify(message: &str) -> Self {
        if STATISTICAL.is_match(message) {
            ErrorCategory::Statistical
        } else if CROSS_FIELD.is_match(message) {
            ErrorCategory::CrossField
        } else if RANGE.is_match(message) {
            ErrorCategory::Range
        } else {
            ErrorCategory::Other
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Range => "RANGE",
            ErrorCategory::CrossField => "PHYSICS",
            ErrorCategory::Statistical => "AGGREGATE",
            ErrorCategory::Other => "CHECK",
        }
    }

    fn hint(&self) -> &'static str {
        match self {
            ErrorCategory::Range => {
                "Value is outside its physical range. Re-read the digits and the unit printed next to it."
            }
            ErrorCategory::CrossField => {
                "Related fields disagree. Re-read every cell voltage and the pack voltage, and confirm power = voltage x current with consistent units."
            }
            ErrorCategory::Statistical => {
                "A reported max/min/average disagrees with the individual readings. Re-read the summary values and each cell they summarize."
            }
            ErrorCategory::Other => "Re-check this field against the image.",
        }
    }
}

const STANDARD_INSTRUCTIONS: [&str; 3] = [
    "Re-examine the image carefully and read each value exactly as displayed.",
    "Verify unit conversions (mV vs V, mA vs A, Wh vs kWh, mAh vs Ah).",
    "Double-check sign conventions: discharge current and power are negative, charge is positive.",
];

/// Build the feedback block for the given upcoming attempt.
pub fn build_feedback(attempt: u32, max_attempts: u32, verdict: &ValidationVerdict) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "RETRY ATTEMPT {attempt} of {max_attempts}: the previous extraction failed validation."
    );

    if !verdict.critical_errors.is_empty() {
        let _ = writeln!(out, "Correct these errors:");
        for (i, error) in verdict.critical_errors.iter().enumerate() {
            let category = ErrorCategory::classify(error);
            let _ = writeln!(out, "{}. [{}] {}", i + 1, category.label(), error);
            let _ = writeln!(out, "   Hint: {}", category.hint());
        }
    }

    if !verdict.warnings.is_empty() {
        let _ = writeln!(out, "Also review these warnings:");
        for warning in &verdict.warnings {
            let _ = writeln!(out, "- {warning}");
        }
    }

    let _ = writeln!(out, "Instructions:");
    for line in STANDARD_INSTRUCTIONS {
        let _ = writeln!(out, "- {line}");
    }
    out
}
