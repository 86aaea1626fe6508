//! Equivalence verdicts and comparison settings

use super::ValidationMethod;
use mathpad_common::hash::ContentHasher;
use serde::{Deserialize, Serialize};

/// Outcome of comparing a row with its nearest non-empty predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub equivalent: bool,
    pub method: ValidationMethod,
    pub time_ms: u64,
    pub canonical_a: Option<String>,
    pub canonical_b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    /// Base case: a row with no non-empty predecessor is equivalent by definition
    pub fn first_row() -> Self {
        Self {
            equivalent: true,
            method: ValidationMethod::FirstRow,
            time_ms: 0,
            canonical_a: None,
            canonical_b: None,
            error: None,
        }
    }
}

/// Options forwarded to the equivalence service
///
/// Part of the validation cache key: changing any field yields new keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonSettings {
    /// Absolute tolerance for numeric sampling fallbacks
    pub numeric_tolerance: f64,
    /// Treat free symbols as real-valued
    pub assume_real: bool,
    /// Allow the service to fall back to numeric sampling
    pub allow_numeric_fallback: bool,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            numeric_tolerance: 1e-9,
            assume_real: true,
            allow_numeric_fallback: true,
        }
    }
}

impl ComparisonSettings {
    pub fn settings_hash(&self) -> String {
        let mut hasher = ContentHasher::new();
        hasher
            .u64(self.numeric_tolerance.to_bits())
            .u64(self.assume_real as u64)
            .u64(self.allow_numeric_fallback as u64);
        hasher.finish()
    }
}
