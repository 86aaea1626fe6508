//! Row pipeline coordinator
//!
//! Wires the row manager to recognition and validation:
//!
//! ```text
//! content changes -> row deactivated -> (OCR debounce) -> tiles -> worker pool
//!   -> merge -> post-process -> row complete -> (validation debounce) -> verdict
//! ```
//!
//! `RowPipeline` is cheap to clone; clones share all state. Every row-level
//! failure ends up on the row itself (`ocr_status`/`validation_status` =
//! error plus `error_message`) and never affects other rows.

use crate::cache::{Cache, CacheNamespace, RestoreReport};
use crate::error::{PipelineError, Result};
use crate::merger::{FragmentMerger, MergeOutcome};
use crate::models::{
    ActivationEvent, ComparisonSettings, OcrStatus, RecognitionResult, Row, RowContent, RowId,
    RowPatch, ValidationResult,
};
use crate::persistence::DocumentStore;
use crate::post_processor::PostProcessor;
use crate::row_manager::{DocumentSnapshot, RowManager};
use crate::scheduler::{Purpose, Scheduler};
use crate::services::{EquivalenceService, Recognizer, SyntaxValidator};
use crate::tiles::TileExtractor;
use crate::validation::{ValidationOrchestrator, ValidationRun, ValidationSummary};
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
use mathpad_common::config::PipelineConfig;
use mathpad_common::events::{EventBus, RowEvent};
use mathpad_common::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// External collaborators the pipeline consumes
#[derive(Clone)]
pub struct Services {
    pub recognizer: Arc<dyn Recognizer>,
    pub equivalence: Arc<dyn EquivalenceService>,
    pub validator: Arc<dyn SyntaxValidator>,
}

/// Outcome of one recognition cycle
#[derive(Debug, Clone, PartialEq)]
pub enum OcrRun {
    /// Row complete; `None` for a row without ink
    Complete { expression: Option<String> },
    /// Row marked as error
    Failed(PipelineError),
    /// Cancelled or overtaken by a newer cycle; nothing applied
    Superseded,
}

/// Outcome of loading persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub rows: usize,
    /// Persisted document was unreadable; started from an empty document
    pub recovered: bool,
    pub recognition_cache: RestoreReport,
    pub validation_cache: RestoreReport,
}

#[derive(Clone)]
pub struct RowPipeline {
    rows: Arc<Mutex<RowManager>>,
    pool: Arc<WorkerPool>,
    merger: Arc<FragmentMerger>,
    post_processor: Arc<PostProcessor>,
    orchestrator: Arc<ValidationOrchestrator>,
    scheduler: Scheduler,
    events: EventBus,
    contents: Arc<StdMutex<HashMap<RowId, RowContent>>>,
    /// Recognition cycle counter per row; a result is applied only by the latest cycle
    ocr_cycles: Arc<StdMutex<HashMap<RowId, u64>>>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl RowPipeline {
    /// Build a pipeline; must be called inside a tokio runtime
    pub fn new(config: PipelineConfig, services: Services, clock: Arc<dyn Clock>) -> Self {
        Self::with_settings(config, services, ComparisonSettings::default(), clock)
    }

    pub fn with_settings(
        config: PipelineConfig,
        services: Services,
        settings: ComparisonSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let events = EventBus::new(256);
        let ttl = chrono::Duration::seconds(config.cache_ttl_secs as i64);

        let recognition_cache: Arc<Cache<RecognitionResult>> = Arc::new(Cache::new(
            CacheNamespace::Recognition,
            ttl,
            Arc::clone(&clock),
        ));
        let validation_cache: Arc<Cache<ValidationResult>> = Arc::new(Cache::new(
            CacheNamespace::Validation,
            ttl,
            Arc::clone(&clock),
        ));

        let pool = WorkerPool::new(
            WorkerPoolConfig::from(&config),
            TileExtractor::from_config(&config),
            services.recognizer,
            recognition_cache,
        );
        let orchestrator = ValidationOrchestrator::new(
            services.equivalence,
            validation_cache,
            settings,
            Duration::from_millis(config.validation_timeout_ms),
        );
        let manager = RowManager::new(config.row_height, Arc::clone(&clock), events.clone());

        Self {
            rows: Arc::new(Mutex::new(manager)),
            pool: Arc::new(pool),
            merger: Arc::new(FragmentMerger::new(Arc::clone(&services.validator))),
            post_processor: Arc::new(PostProcessor::new(services.validator)),
            orchestrator: Arc::new(orchestrator),
            scheduler: Scheduler::new(),
            events,
            contents: Arc::new(StdMutex::new(HashMap::new())),
            ocr_cycles: Arc::new(StdMutex::new(HashMap::new())),
            config,
            clock,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn orchestrator(&self) -> &ValidationOrchestrator {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn contents(&self) -> MutexGuard<'_, HashMap<RowId, RowContent>> {
        self.contents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ocr_cycles(&self) -> MutexGuard<'_, HashMap<RowId, u64>> {
        self.ocr_cycles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new recognition cycle for a row, superseding any older one
    fn next_cycle(&self, id: RowId) -> u64 {
        let mut cycles = self.ocr_cycles();
        let cycle = cycles.entry(id).or_insert(0);
        *cycle += 1;
        *cycle
    }

    fn is_current_cycle(&self, id: RowId, cycle: u64) -> bool {
        self.ocr_cycles().get(&id) == Some(&cycle)
    }

    pub async fn row(&self, id: RowId) -> Result<Row> {
        self.rows.lock().await.get_row(id).cloned()
    }

    pub async fn rows(&self) -> Vec<Row> {
        self.rows.lock().await.rows().to_vec()
    }

    pub async fn active_row(&self) -> Option<RowId> {
        self.rows.lock().await.active_row()
    }

    pub async fn activation_timeline(&self) -> Vec<ActivationEvent> {
        self.rows.lock().await.get_activation_timeline().to_vec()
    }

    pub async fn snapshot(&self) -> DocumentSnapshot {
        self.rows.lock().await.serialize()
    }

    /// Append a row below the last one
    pub async fn create_row(&self) -> RowId {
        self.rows.lock().await.create_row()
    }

    /// Replace the ink of a row
    ///
    /// Recognition is not triggered here; it follows deactivation.
    pub async fn update_content(&self, id: RowId, content: RowContent) -> Result<()> {
        self.rows.lock().await.get_row(id)?;
        self.contents().insert(id, content);
        Ok(())
    }

    /// Apply a partial update from an outer surface
    pub async fn update_row(&self, id: RowId, patch: RowPatch) -> Result<Row> {
        let update = self.rows.lock().await.update_row(id, patch)?;
        for row in &update.invalidated {
            self.orchestrator.invalidate_row(*row);
        }
        Ok(update.row)
    }

    /// Focus a row; the row losing focus is queued for recognition if its ink changed
    pub async fn set_active_row(&self, id: RowId) -> Result<()> {
        let mut manager = self.rows.lock().await;
        if let Some(previous) = manager.set_active_row(id)? {
            self.handle_deactivation(&mut manager, previous)?;
        }
        Ok(())
    }

    /// Focus a row, creating rows when moving past the last one
    pub async fn navigate_to(&self, id: RowId) -> Result<()> {
        let mut manager = self.rows.lock().await;
        if let Some(previous) = manager.navigate_to(id) {
            self.handle_deactivation(&mut manager, previous)?;
        }
        Ok(())
    }

    fn handle_deactivation(&self, manager: &mut RowManager, id: RowId) -> Result<()> {
        // Rows whose ink was never observed keep their recognized state
        let hash = self.contents().get(&id).map(RowContent::content_hash);
        let changed = match hash {
            Some(hash) => {
                let was_processing = manager.get_row(id)?.ocr_status == OcrStatus::Processing;
                let changed = manager.note_content(id, &hash)?;
                if changed && was_processing {
                    self.next_cycle(id);
                    self.pool.cancel_row(id);
                }
                changed
            }
            None => false,
        };

        self.events.emit_lossy(RowEvent::RowDeactivated {
            row_id: id,
            content_changed: changed,
            timestamp: self.clock.now(),
        });

        if changed {
            self.schedule_ocr(id);
        }
        Ok(())
    }

    fn schedule_ocr(&self, id: RowId) {
        let pipeline = self.clone();
        self.scheduler.schedule(
            id,
            Purpose::Ocr,
            Duration::from_millis(self.config.ocr_debounce_ms),
            move || async move {
                if let Err(e) = pipeline.run_ocr(id).await {
                    warn!(row_id = %id, error = %e, "Debounced recognition failed to start");
                }
            },
        );
    }

    fn schedule_validation(&self, id: RowId) {
        let pipeline = self.clone();
        self.scheduler.schedule(
            id,
            Purpose::Validation,
            Duration::from_millis(self.config.validation_debounce_ms),
            move || async move {
                if let Err(e) = pipeline.orchestrator.validate_row(&pipeline.rows, id).await {
                    warn!(row_id = %id, error = %e, "Debounced validation failed to start");
                }
            },
        );
    }

    /// Recognize a row now, bypassing the debounce
    ///
    /// Only `RowNotFound` and rejected state transitions are returned as
    /// errors; recognition failures are stored on the row.
    pub async fn run_ocr(&self, id: RowId) -> Result<OcrRun> {
        self.scheduler.cancel(id, Purpose::Ocr);

        let (row, content, hash, cycle) = {
            let mut manager = self.rows.lock().await;
            let status = manager.get_row(id)?.ocr_status;
            match status {
                OcrStatus::Processing => {
                    self.pool.cancel_row(id);
                    manager.update_row(id, RowPatch::ocr(OcrStatus::Pending))?;
                }
                OcrStatus::Complete => {
                    manager.update_row(id, RowPatch::ocr(OcrStatus::Pending))?;
                }
                OcrStatus::Pending | OcrStatus::Error => {}
            }
            let row = manager
                .update_row(id, RowPatch::ocr(OcrStatus::Processing).with_error(None))?
                .row;
            let content = self.contents().get(&id).cloned().unwrap_or_default();
            let hash = content.content_hash();
            (row, content, hash, self.next_cycle(id))
        };

        info!(row_id = %id, strokes = content.strokes.len(), "Recognizing row");
        let outcome = self
            .pool
            .process_row(&row, &content, &self.merger)
            .await
            .and_then(|merged| self.finish_expression(merged));

        let mut manager = self.rows.lock().await;
        let still_processing = manager.get_row(id)?.ocr_status == OcrStatus::Processing;
        if !self.is_current_cycle(id, cycle) || !still_processing {
            info!(row_id = %id, "Recognition result discarded");
            return Ok(OcrRun::Superseded);
        }

        match outcome {
            Err(PipelineError::Cancelled(_)) => {
                manager.update_row(id, RowPatch::ocr(OcrStatus::Pending))?;
                Ok(OcrRun::Superseded)
            }
            Ok(expression) => {
                let update = manager.update_row(
                    id,
                    RowPatch::ocr(OcrStatus::Complete)
                        .with_expression(expression.clone())
                        .with_error(None)
                        .with_content_hash(Some(hash)),
                )?;
                drop(manager);

                self.orchestrator.invalidate_row(id);
                for dependent in &update.invalidated {
                    self.orchestrator.invalidate_row(*dependent);
                }
                self.schedule_validation(id);
                for dependent in update.invalidated {
                    self.schedule_validation(dependent);
                }
                info!(row_id = %id, expression = ?expression, "Row recognized");
                Ok(OcrRun::Complete { expression })
            }
            Err(e) => {
                manager.update_row(
                    id,
                    RowPatch::ocr(OcrStatus::Error)
                        .with_expression(None)
                        .with_error(Some(e.to_string()))
                        .with_content_hash(Some(hash)),
                )?;
                let affected = self.orchestrator.invalidate_downstream(&mut manager, id);
                drop(manager);

                for dependent in affected {
                    self.schedule_validation(dependent);
                }
                warn!(row_id = %id, error = %e, "Row recognition failed");
                Ok(OcrRun::Failed(e))
            }
        }
    }

    /// Abort recognition of a row and put it back to pending
    ///
    /// Returns the number of queued tiles dropped. Other rows are untouched.
    pub async fn cancel_ocr(&self, id: RowId) -> Result<usize> {
        let mut manager = self.rows.lock().await;
        let status = manager.get_row(id)?.ocr_status;
        self.scheduler.cancel(id, Purpose::Ocr);
        self.next_cycle(id);
        let removed = self.pool.cancel_row(id);
        if status == OcrStatus::Processing {
            manager.update_row(id, RowPatch::ocr(OcrStatus::Pending))?;
        }
        info!(row_id = %id, removed, "Recognition cancelled");
        Ok(removed)
    }

    /// Validate a row now, bypassing the debounce
    pub async fn validate_row(&self, id: RowId) -> Result<ValidationRun> {
        self.scheduler.cancel(id, Purpose::Validation);
        self.orchestrator.validate_row(&self.rows, id).await
    }

    pub async fn validate_all(&self) -> ValidationSummary {
        self.orchestrator.validate_all(&self.rows).await
    }

    /// Explicit user retry of a failed row
    pub async fn retry_row(&self, id: RowId) -> Result<()> {
        let row = self.row(id).await?;
        if row.ocr_status != OcrStatus::Complete {
            if let OcrRun::Complete { .. } = self.run_ocr(id).await? {
                self.validate_row(id).await?;
            }
        } else {
            self.validate_row(id).await?;
        }
        Ok(())
    }

    /// Drop all rows, ink and pending work
    pub async fn clear(&self) {
        let mut manager = self.rows.lock().await;
        self.scheduler.cancel_all();
        for row in manager.rows() {
            self.next_cycle(row.id);
            self.pool.cancel_row(row.id);
        }
        self.contents().clear();
        manager.clear();
    }

    /// Persist the document and both caches
    pub async fn save(&self, store: &dyn DocumentStore) -> Result<()> {
        let snapshot = self.snapshot().await;
        store.save_document(&snapshot).await?;

        let mut entries = self.pool.cache().export();
        entries.extend(self.orchestrator.cache().export());
        store.save_cache(&entries).await?;

        info!(rows = snapshot.rows.len(), cache_entries = entries.len(), "Saved document");
        Ok(())
    }

    /// Replace the in-memory document with persisted state
    ///
    /// Never fails on unreadable state: a corrupt document is logged and
    /// replaced by an empty one.
    pub async fn load(&self, store: &dyn DocumentStore) -> LoadReport {
        let restored = match store.load_document().await {
            Ok(Some(snapshot)) => {
                RowManager::deserialize(snapshot, Arc::clone(&self.clock), self.events.clone())
                    .map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };

        let (manager, recovered) = match restored {
            Ok(Some(manager)) => (manager, false),
            Ok(None) => (self.empty_manager(), false),
            Err(e) => {
                error!(error = %e, "Could not load document; starting with an empty one");
                (self.empty_manager(), true)
            }
        };
        let row_count = manager.row_count();

        {
            let mut current = self.rows.lock().await;
            self.scheduler.cancel_all();
            for row in current.rows() {
                self.next_cycle(row.id);
                self.pool.cancel_row(row.id);
            }
            self.contents().clear();
            *current = manager;
        }

        let entries = match store.load_cache().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not load caches; starting cold");
                Vec::new()
            }
        };
        let recognition_cache = self.pool.cache().restore(&entries);
        let validation_cache = self.orchestrator.cache().restore(&entries);
        self.pool.cache().purge_expired();
        self.orchestrator.cache().purge_expired();

        self.events.emit_lossy(RowEvent::DocumentLoaded {
            row_count,
            recovered,
            timestamp: self.clock.now(),
        });
        info!(rows = row_count, recovered, "Loaded document");

        LoadReport {
            rows: row_count,
            recovered,
            recognition_cache,
            validation_cache,
        }
    }

    /// Clean a merged row into its final expression
    ///
    /// Merged text that fails to parse still goes through cleanup: symbol
    /// normalization can repair it, and only the cleaned text decides.
    fn finish_expression(&self, merged: MergeOutcome) -> Result<Option<String>> {
        if merged.text.is_empty() {
            return Ok(None);
        }
        let processed = self.post_processor.process(merged);
        if !processed.valid {
            let mut errors = processed.errors;
            errors.dedup();
            return Err(PipelineError::InvalidMerge(errors.join("; ")));
        }
        Ok(Some(processed.expression))
    }

    fn empty_manager(&self) -> RowManager {
        RowManager::new(self.config.row_height, Arc::clone(&self.clock), self.events.clone())
    }
}
