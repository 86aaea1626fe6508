//! Row state and partial updates
//!
//! A row is one horizontal writing lane. Identity and band are fixed at
//! creation; everything else changes through `RowPatch` applied by the
//! RowManager.

use super::{OcrStatus, RowId, ValidationResult, ValidationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One horizontal writing lane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: RowId,
    pub y_start: u32,
    pub y_end: u32,
    pub is_active: bool,
    pub ocr_status: OcrStatus,
    pub validation_status: ValidationStatus,
    pub expression: Option<String>,
    pub validation_result: Option<ValidationResult>,
    pub error_message: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Hash of the content last handed to recognition
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl Row {
    pub fn new(id: RowId, row_height: u32) -> Self {
        let y_start = id.0 * row_height;
        Self {
            id,
            y_start,
            y_end: y_start + row_height,
            is_active: false,
            ocr_status: OcrStatus::Pending,
            validation_status: ValidationStatus::Pending,
            expression: None,
            validation_result: None,
            error_message: None,
            activated_at: None,
            content_hash: None,
        }
    }

    pub fn height(&self) -> u32 {
        self.y_end - self.y_start
    }

    /// Rows without an expression are skipped when looking for a predecessor
    pub fn has_expression(&self) -> bool {
        self.expression
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty())
    }

    /// Check a patch against this row without touching it
    pub fn check_patch(&self, patch: &RowPatch) -> Result<(), String> {
        let next_ocr = patch.ocr_status.unwrap_or(self.ocr_status);
        if let Some(status) = patch.ocr_status {
            if !self.ocr_status.can_transition_to(status) {
                return Err(format!(
                    "illegal ocr transition {} -> {}",
                    self.ocr_status, status
                ));
            }
        }

        let next_validation = patch.validation_status.unwrap_or(self.validation_status);
        if let Some(status) = patch.validation_status {
            if !self.validation_status.can_transition_to(status) {
                return Err(format!(
                    "illegal validation transition {} -> {}",
                    self.validation_status, status
                ));
            }
        }

        if let Some(Some(expression)) = &patch.expression {
            if expression.trim().is_empty() {
                return Err("expression must be non-empty; use null for empty rows".to_string());
            }
            if next_ocr != OcrStatus::Complete {
                return Err(format!(
                    "expression can only be set with ocr status complete (got {})",
                    next_ocr
                ));
            }
        }

        if let Some(Some(_)) = &patch.validation_result {
            if !matches!(
                next_validation,
                ValidationStatus::Validated | ValidationStatus::Invalid
            ) {
                return Err(format!(
                    "validation result requires a validated/invalid status (got {})",
                    next_validation
                ));
            }
        }

        Ok(())
    }

    /// Merge a checked patch into the row
    pub(crate) fn apply_patch(&mut self, patch: RowPatch) {
        if let Some(status) = patch.ocr_status {
            self.ocr_status = status;
        }
        if let Some(status) = patch.validation_status {
            self.validation_status = status;
        }
        if let Some(expression) = patch.expression {
            self.expression = expression;
        }
        if let Some(result) = patch.validation_result {
            self.validation_result = result;
        }
        if let Some(message) = patch.error_message {
            self.error_message = message;
        }
        if let Some(hash) = patch.content_hash {
            self.content_hash = hash;
        }
    }
}

/// Partial row update
///
/// Outer `None` leaves a field untouched; `Some(None)` clears a nullable
/// field. Identity, band and activation are not patchable: unknown fields are
/// rejected at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RowPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_status: Option<OcrStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<ValidationStatus>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub expression: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<Option<ValidationResult>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<Option<String>>,
}

/// Distinguish an explicit `null` from an absent field
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl RowPatch {
    pub fn ocr(status: OcrStatus) -> Self {
        Self {
            ocr_status: Some(status),
            ..Default::default()
        }
    }

    pub fn validation(status: ValidationStatus) -> Self {
        Self {
            validation_status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_expression(mut self, expression: Option<String>) -> Self {
        self.expression = Some(expression);
        self
    }

    pub fn with_error(mut self, message: Option<String>) -> Self {
        self.error_message = Some(message);
        self
    }

    pub fn with_result(mut self, result: Option<ValidationResult>) -> Self {
        self.validation_result = Some(result);
        self
    }

    pub fn with_content_hash(mut self, hash: Option<String>) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == RowPatch::default()
    }
}

/// One interval during which a row was the active row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationEvent {
    pub row_id: RowId,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}
