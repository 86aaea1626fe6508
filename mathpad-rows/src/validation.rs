//! Validation orchestrator
//!
//! Compares each row's expression with the nearest non-empty row above it.
//! A row with no such predecessor is equivalent by definition; otherwise the
//! verdict comes from the cache or the equivalence service.
//!
//! The row manager lock is never held while waiting on the service. Before a
//! fresh verdict is stored, both expressions are re-read; if either changed
//! in the meantime the verdict is dropped.

use crate::cache::Cache;
use crate::error::{PipelineError, Result};
use crate::models::{ComparisonSettings, RowId, RowPatch, ValidationResult, ValidationStatus};
use crate::row_manager::RowManager;
use crate::services::{EquivalenceError, EquivalenceService};
use mathpad_common::hash::content_hash;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What `validate_row` did
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationRun {
    /// Verdict stored on the row
    Recorded {
        result: ValidationResult,
        cached: bool,
    },
    /// Row marked as error
    Failed(PipelineError),
    /// Row has no recognized expression
    Skipped,
    /// An expression changed while the service was running; nothing stored
    Superseded,
}

/// Aggregate counts from `validate_all`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub validated: usize,
    pub invalid: usize,
    pub errors: usize,
    pub skipped: usize,
    pub cache_hits: usize,
}

/// Cache key for comparing `previous` with `current` under `settings`
pub fn validation_key(previous: &str, current: &str, settings: &ComparisonSettings) -> String {
    format!(
        "{}:{}:{}",
        content_hash(previous.as_bytes()),
        content_hash(current.as_bytes()),
        settings.settings_hash()
    )
}

pub struct ValidationOrchestrator {
    service: Arc<dyn EquivalenceService>,
    cache: Arc<Cache<ValidationResult>>,
    settings: ComparisonSettings,
    timeout: Duration,
    /// Last cache key used per row, for targeted invalidation
    row_keys: StdMutex<HashMap<RowId, String>>,
}

impl ValidationOrchestrator {
    pub fn new(
        service: Arc<dyn EquivalenceService>,
        cache: Arc<Cache<ValidationResult>>,
        settings: ComparisonSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            cache,
            settings,
            timeout,
            row_keys: StdMutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<Cache<ValidationResult>> {
        &self.cache
    }

    pub fn settings(&self) -> &ComparisonSettings {
        &self.settings
    }

    fn row_keys(&self) -> MutexGuard<'_, HashMap<RowId, String>> {
        self.row_keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache key last used for a row
    pub fn cache_key_for(&self, id: RowId) -> Option<String> {
        self.row_keys().get(&id).cloned()
    }

    /// Validate one row now
    ///
    /// Only `RowNotFound` is returned as an error; service failures are
    /// stored on the row and reported as `ValidationRun::Failed`.
    pub async fn validate_row(&self, rows: &Mutex<RowManager>, id: RowId) -> Result<ValidationRun> {
        let (previous, current) = {
            let mut manager = rows.lock().await;
            let row = manager.get_row(id)?;
            let Some(current) = row.expression.clone().filter(|_| row.has_expression()) else {
                debug!(row_id = %id, "Skipping validation of empty row");
                return Ok(ValidationRun::Skipped);
            };
            let previous = manager.predecessor_of(id).and_then(|r| r.expression.clone());

            begin(&mut manager, id)?;

            let Some(previous) = previous else {
                let result = ValidationResult::first_row();
                manager.record_validation(id, Ok(result.clone()))?;
                self.row_keys().remove(&id);
                debug!(row_id = %id, "First non-empty row validated by definition");
                return Ok(ValidationRun::Recorded {
                    result,
                    cached: false,
                });
            };

            let key = validation_key(&previous, &current, &self.settings);
            self.row_keys().insert(id, key.clone());
            if let Some(result) = self.cache.get(&key) {
                manager.record_validation(id, Ok(result.clone()))?;
                debug!(row_id = %id, equivalent = result.equivalent, "Validation cache hit");
                return Ok(ValidationRun::Recorded {
                    result,
                    cached: true,
                });
            }
            (previous, current)
        };

        let verdict = self.check(&previous, &current).await;

        let mut manager = rows.lock().await;
        let row = manager.get_row(id)?;
        let still_current = row.validation_status == ValidationStatus::Processing
            && row.expression.as_deref() == Some(current.as_str())
            && manager.predecessor_of(id).and_then(|r| r.expression.as_deref())
                == Some(previous.as_str());
        if !still_current {
            debug!(row_id = %id, "Discarding verdict for changed expressions");
            if manager.get_row(id)?.validation_status == ValidationStatus::Processing {
                manager.update_row(id, RowPatch::validation(ValidationStatus::Pending))?;
            }
            return Ok(ValidationRun::Superseded);
        }

        match verdict {
            Ok(result) => {
                self.cache
                    .put(validation_key(&previous, &current, &self.settings), result.clone());
                manager.record_validation(id, Ok(result.clone()))?;
                info!(
                    row_id = %id,
                    equivalent = result.equivalent,
                    method = ?result.method,
                    time_ms = result.time_ms,
                    "Row validated"
                );
                Ok(ValidationRun::Recorded {
                    result,
                    cached: false,
                })
            }
            Err(e) => {
                warn!(row_id = %id, error = %e, "Row validation failed");
                manager.record_validation(id, Err(e.clone()))?;
                Ok(ValidationRun::Failed(e))
            }
        }
    }

    /// Call the equivalence service under the hard timeout
    async fn check(&self, previous: &str, current: &str) -> Result<ValidationResult> {
        let call = self
            .service
            .check_equivalence(previous, current, &self.settings);
        match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(PipelineError::Timeout(self.timeout.as_millis() as u64)),
            Ok(Err(EquivalenceError::Parse(detail))) => Err(PipelineError::ParseFailure(detail)),
            Ok(Err(EquivalenceError::Service(detail))) => {
                Err(PipelineError::EquivalenceServiceError(detail))
            }
            Ok(Ok(outcome)) => Ok(ValidationResult {
                equivalent: outcome.equivalent,
                method: outcome.method,
                time_ms: outcome.time_ms,
                canonical_a: outcome.canonical_a,
                canonical_b: outcome.canonical_b,
                error: None,
            }),
        }
    }

    /// Validate every row top to bottom
    pub async fn validate_all(&self, rows: &Mutex<RowManager>) -> ValidationSummary {
        let count = rows.lock().await.row_count();
        let mut summary = ValidationSummary::default();

        for index in 0..count {
            match self.validate_row(rows, RowId(index as u32)).await {
                Ok(ValidationRun::Recorded { result, cached }) => {
                    if result.equivalent {
                        summary.validated += 1;
                    } else {
                        summary.invalid += 1;
                    }
                    if cached {
                        summary.cache_hits += 1;
                    }
                }
                Ok(ValidationRun::Failed(_)) | Err(_) => summary.errors += 1,
                Ok(ValidationRun::Skipped) | Ok(ValidationRun::Superseded) => summary.skipped += 1,
            }
        }

        info!(
            validated = summary.validated,
            invalid = summary.invalid,
            errors = summary.errors,
            skipped = summary.skipped,
            cache_hits = summary.cache_hits,
            "Validated all rows"
        );
        summary
    }

    /// Forget the cached verdict a row last used
    pub fn invalidate_row(&self, id: RowId) -> bool {
        match self.row_keys().remove(&id) {
            Some(key) => self.cache.remove(&key),
            None => false,
        }
    }

    /// Re-arm and forget the verdict of the row that depends on `id`
    pub fn invalidate_downstream(&self, manager: &mut RowManager, id: RowId) -> Vec<RowId> {
        let affected = manager.invalidate_downstream(id);
        for row in &affected {
            self.invalidate_row(*row);
        }
        affected
    }
}

/// Move a row's validation into `processing`
fn begin(manager: &mut RowManager, id: RowId) -> Result<()> {
    let status = manager.get_row(id)?.validation_status;
    if status.is_terminal() {
        manager.update_row(id, RowPatch::validation(ValidationStatus::Pending))?;
    }
    if status != ValidationStatus::Processing {
        manager.update_row(id, RowPatch::validation(ValidationStatus::Processing))?;
    }
    Ok(())
}
