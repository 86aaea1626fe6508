//! Row identity and status types
//!
//! Shared by the row pipeline and anything consuming its events. Status
//! values form a closed set; serde rejects any other string.

use serde::{Deserialize, Serialize};

/// Stable row identifier derived from the row's sequence position
///
/// Never reused: rows are only ever appended or bulk-cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(pub u32);

impl RowId {
    /// Position of the row in the document
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "row-{:04}", self.0)
    }
}

/// Recognition state of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
    /// Content changed (or never recognized); waiting for the OCR trigger
    #[default]
    Pending,
    /// Tiles submitted to the worker pool
    Processing,
    /// Expression reconstructed
    Complete,
    /// Recognition failed; see the row's error message
    Error,
}

impl OcrStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: OcrStatus) -> bool {
        use OcrStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Processing)
                | (Processing, Complete)
                | (Processing, Error)
                // cancellation
                | (Processing, Pending)
                // content changed after completion
                | (Complete, Pending)
                // explicit retry
                | (Error, Pending)
                | (Error, Processing)
        )
    }
}

impl std::fmt::Display for OcrStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OcrStatus::Pending => write!(f, "pending"),
            OcrStatus::Processing => write!(f, "processing"),
            OcrStatus::Complete => write!(f, "complete"),
            OcrStatus::Error => write!(f, "error"),
        }
    }
}

/// Equivalence-check state of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    #[default]
    Pending,
    Processing,
    /// Equivalent to the nearest non-empty predecessor
    Validated,
    /// Not equivalent to the nearest non-empty predecessor
    Invalid,
    Error,
}

impl ValidationStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ValidationStatus) -> bool {
        use ValidationStatus::*;
        match (self, next) {
            (Pending, Pending) | (Pending, Processing) => true,
            (Processing, Validated) | (Processing, Invalid) | (Processing, Error) => true,
            // invalidated while a check was in flight
            (Processing, Pending) => true,
            (Validated | Invalid | Error, Pending) => true,
            _ => false,
        }
    }

    /// Terminal states carry a validation result or an error message
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ValidationStatus::Validated | ValidationStatus::Invalid | ValidationStatus::Error
        )
    }
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStatus::Pending => write!(f, "pending"),
            ValidationStatus::Processing => write!(f, "processing"),
            ValidationStatus::Validated => write!(f, "validated"),
            ValidationStatus::Invalid => write!(f, "invalid"),
            ValidationStatus::Error => write!(f, "error"),
        }
    }
}

/// How an equivalence verdict was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMethod {
    /// No non-empty predecessor; equivalent by definition
    FirstRow,
    /// Canonical forms matched directly
    FastPath,
    /// Full symbolic comparison
    Fallback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_are_closed() {
        assert_eq!(serde_json::to_string(&OcrStatus::Complete).unwrap(), "\"complete\"");
        assert!(serde_json::from_str::<OcrStatus>("\"done\"").is_err());
        assert!(serde_json::from_str::<ValidationStatus>("\"valid\"").is_err());
        assert_eq!(
            serde_json::to_string(&ValidationMethod::FirstRow).unwrap(),
            "\"first-row\""
        );
    }

    #[test]
    fn test_ocr_transitions() {
        assert!(OcrStatus::Pending.can_transition_to(OcrStatus::Processing));
        assert!(OcrStatus::Processing.can_transition_to(OcrStatus::Complete));
        assert!(OcrStatus::Complete.can_transition_to(OcrStatus::Pending));
        assert!(!OcrStatus::Pending.can_transition_to(OcrStatus::Complete));
        assert!(!OcrStatus::Complete.can_transition_to(OcrStatus::Error));
    }

    #[test]
    fn test_validation_transitions() {
        assert!(ValidationStatus::Processing.can_transition_to(ValidationStatus::Invalid));
        assert!(ValidationStatus::Validated.can_transition_to(ValidationStatus::Pending));
        assert!(!ValidationStatus::Pending.can_transition_to(ValidationStatus::Validated));
        assert!(!ValidationStatus::Invalid.can_transition_to(ValidationStatus::Validated));
    }

    #[test]
    fn test_row_id_display() {
        assert_eq!(RowId(7).to_string(), "row-0007");
        assert_eq!(RowId(12).index(), 12);
    }
}
