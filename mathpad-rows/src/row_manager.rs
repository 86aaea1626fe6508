//! Row manager
//!
//! Single owner of row metadata, the active-row pointer and the activation
//! timeline. Rows live in an arena indexed by `RowId`; the timeline refers to
//! rows by id only.
//!
//! **Invariants:**
//! - Row ids and bands never change after creation
//! - At most one row is active, and exactly one once any row exists
//! - `set_active_row` is the only place `is_active` flips
//! - Timeline `activated_at` stamps never decrease

use crate::error::{PipelineError, Result};
use crate::models::{
    ActivationEvent, OcrStatus, Row, RowId, RowPatch, ValidationResult, ValidationStatus,
};
use chrono::{DateTime, Utc};
use mathpad_common::events::{EventBus, RowEvent};
use mathpad_common::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Persisted document format version
pub const DOCUMENT_VERSION: u32 = 1;

/// Full row state as handed to the persistence collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub rows: Vec<Row>,
    pub active_row_id: Option<RowId>,
    pub activation_timeline: Vec<ActivationEvent>,
    pub row_height: u32,
    pub version: u32,
}

/// Effect of an accepted row update
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    /// Row state after the update
    pub row: Row,
    /// Rows whose validation was re-armed because their predecessor changed
    pub invalidated: Vec<RowId>,
}

pub struct RowManager {
    rows: Vec<Row>,
    active_row: Option<RowId>,
    timeline: Vec<ActivationEvent>,
    row_height: u32,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl RowManager {
    /// New document with one active row
    pub fn new(row_height: u32, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let mut manager = Self {
            rows: Vec::new(),
            active_row: None,
            timeline: Vec::new(),
            row_height,
            clock,
            events,
        };
        manager.reset();
        manager
    }

    fn reset(&mut self) {
        self.rows.clear();
        self.timeline.clear();
        self.active_row = None;
        let first = self.create_row();
        self.activate(first);
    }

    pub fn row_height(&self) -> u32 {
        self.row_height
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn active_row(&self) -> Option<RowId> {
        self.active_row
    }

    pub fn get_row(&self, id: RowId) -> Result<&Row> {
        self.rows.get(id.index()).ok_or(PipelineError::RowNotFound(id))
    }

    fn row_mut(&mut self, id: RowId) -> Result<&mut Row> {
        self.rows
            .get_mut(id.index())
            .ok_or(PipelineError::RowNotFound(id))
    }

    /// Ordered activation log
    pub fn get_activation_timeline(&self) -> &[ActivationEvent] {
        &self.timeline
    }

    /// Append a row directly below the lowest band
    pub fn create_row(&mut self) -> RowId {
        let id = RowId(self.rows.len() as u32);
        let row = Row::new(id, self.row_height);
        debug!(row_id = %id, y_start = row.y_start, y_end = row.y_end, "Created row");
        self.events.emit_lossy(RowEvent::RowCreated {
            row_id: id,
            y_start: row.y_start,
            y_end: row.y_end,
            timestamp: self.clock.now(),
        });
        self.rows.push(row);
        id
    }

    /// Make `id` the active row
    ///
    /// Closes the open timeline entry and opens a new one. Returns the row
    /// that lost focus, if any. Re-activating the active row is a no-op.
    pub fn set_active_row(&mut self, id: RowId) -> Result<Option<RowId>> {
        self.get_row(id)?;
        if self.active_row == Some(id) {
            return Ok(None);
        }
        Ok(self.activate(id))
    }

    fn activate(&mut self, id: RowId) -> Option<RowId> {
        // Stamps stay monotonic even if the wall clock steps backwards
        let now = match self.timeline.last() {
            Some(last) => self.clock.now().max(last.activated_at),
            None => self.clock.now(),
        };

        let previous = self.active_row.take();
        if let Some(prev) = previous {
            if let Some(row) = self.rows.get_mut(prev.index()) {
                row.is_active = false;
            }
            if let Some(open) = self
                .timeline
                .last_mut()
                .filter(|e| e.row_id == prev && e.deactivated_at.is_none())
            {
                open.deactivated_at = Some(now);
            }
        }

        if let Some(row) = self.rows.get_mut(id.index()) {
            row.is_active = true;
            row.activated_at = Some(now);
        }
        self.active_row = Some(id);
        self.timeline.push(ActivationEvent {
            row_id: id,
            activated_at: now,
            deactivated_at: None,
        });

        debug!(row_id = %id, previous = ?previous, "Activated row");
        self.events.emit_lossy(RowEvent::RowActivated {
            row_id: id,
            timestamp: now,
        });
        previous
    }

    /// Activate `id`, appending rows first when it lies past the last row
    pub fn navigate_to(&mut self, id: RowId) -> Option<RowId> {
        while self.rows.len() <= id.index() {
            self.create_row();
        }
        self.activate_if_needed(id)
    }

    fn activate_if_needed(&mut self, id: RowId) -> Option<RowId> {
        if self.active_row == Some(id) {
            None
        } else {
            self.activate(id)
        }
    }

    /// Merge a partial update into a row
    ///
    /// The whole patch is checked first; a rejected patch leaves the row
    /// untouched. An OCR transition to `complete` re-arms this row's
    /// validation and that of its direct dependent.
    pub fn update_row(&mut self, id: RowId, patch: RowPatch) -> Result<RowUpdate> {
        let row = self.get_row(id)?;
        if let Err(reason) = row.check_patch(&patch) {
            warn!(row_id = %id, reason = %reason, "Rejected row update");
            return Err(PipelineError::MalformedUpdate(reason));
        }

        let old_ocr = row.ocr_status;
        let old_validation = row.validation_status;
        let method = patch
            .validation_result
            .as_ref()
            .and_then(|r| r.as_ref())
            .map(|r| r.method);

        let row = self.row_mut(id)?;
        row.apply_patch(patch);
        let new_ocr = row.ocr_status;
        let new_validation = row.validation_status;
        let error_message = row.error_message.clone();

        if old_ocr != new_ocr {
            debug!(row_id = %id, old = %old_ocr, new = %new_ocr, "OCR status changed");
            self.events.emit_lossy(RowEvent::OcrStatusChanged {
                row_id: id,
                old_status: old_ocr,
                new_status: new_ocr,
                error_message,
                timestamp: self.clock.now(),
            });
        }
        if old_validation != new_validation {
            debug!(
                row_id = %id,
                old = %old_validation,
                new = %new_validation,
                "Validation status changed"
            );
            self.events.emit_lossy(RowEvent::ValidationStatusChanged {
                row_id: id,
                old_status: old_validation,
                new_status: new_validation,
                method,
                timestamp: self.clock.now(),
            });
        }

        let mut invalidated = Vec::new();
        if old_ocr != OcrStatus::Complete && new_ocr == OcrStatus::Complete {
            self.rearm_validation(id);
            invalidated = self.invalidate_downstream(id);
        }

        Ok(RowUpdate {
            row: self.get_row(id)?.clone(),
            invalidated,
        })
    }

    /// Reset a row's validation to pending, dropping any verdict
    fn rearm_validation(&mut self, id: RowId) {
        let now = self.clock.now();
        let Some(row) = self.rows.get_mut(id.index()) else {
            return;
        };
        let old = row.validation_status;
        row.validation_status = ValidationStatus::Pending;
        row.validation_result = None;
        if old != ValidationStatus::Pending {
            self.events.emit_lossy(RowEvent::ValidationStatusChanged {
                row_id: id,
                old_status: old,
                new_status: ValidationStatus::Pending,
                method: None,
                timestamp: now,
            });
        }
    }

    /// Nearest row before `id` that carries an expression
    pub fn predecessor_of(&self, id: RowId) -> Option<&Row> {
        self.rows[..id.index().min(self.rows.len())]
            .iter()
            .rev()
            .find(|r| r.has_expression())
    }

    /// Nearest row after `id` that carries an expression
    pub fn successor_of(&self, id: RowId) -> Option<&Row> {
        self.rows
            .iter()
            .skip(id.index() + 1)
            .find(|r| r.has_expression())
    }

    /// Re-arm validation of the row that compares against `id`
    ///
    /// Only the nearest non-empty row after `id` reads `id`'s expression;
    /// rows further down compare against their own predecessors and keep
    /// their verdicts. Returns the re-armed rows.
    pub fn invalidate_downstream(&mut self, id: RowId) -> Vec<RowId> {
        let Some(dependent) = self.successor_of(id).map(|r| r.id) else {
            return Vec::new();
        };
        self.rearm_validation(dependent);
        debug!(row_id = %id, dependent = %dependent, "Invalidated downstream validation");
        vec![dependent]
    }

    /// Compare freshly observed content with what was last recognized
    ///
    /// On change the row's OCR is re-armed to pending. Returns whether the
    /// content changed.
    pub fn note_content(&mut self, id: RowId, content_hash: &str) -> Result<bool> {
        let row = self.get_row(id)?;
        if row.content_hash.as_deref() == Some(content_hash) {
            return Ok(false);
        }
        if row.ocr_status != OcrStatus::Pending {
            self.update_row(id, RowPatch::ocr(OcrStatus::Pending))?;
        }
        Ok(true)
    }

    /// Drop every row and the timeline, then start over with one active row
    pub fn clear(&mut self) {
        info!(rows = self.rows.len(), "Clearing document");
        self.reset();
    }

    /// Snapshot for persistence
    pub fn serialize(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            rows: self.rows.clone(),
            active_row_id: self.active_row,
            activation_timeline: self.timeline.clone(),
            row_height: self.row_height,
            version: DOCUMENT_VERSION,
        }
    }

    /// Rebuild a manager from a snapshot
    ///
    /// In-flight states cannot survive a restart: rows saved while
    /// processing come back as pending.
    pub fn deserialize(
        snapshot: DocumentSnapshot,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self> {
        check_snapshot(&snapshot).map_err(PipelineError::PersistedStateCorrupt)?;

        let mut rows = snapshot.rows;
        for row in &mut rows {
            if row.ocr_status == OcrStatus::Processing {
                row.ocr_status = OcrStatus::Pending;
            }
            if row.validation_status == ValidationStatus::Processing {
                row.validation_status = ValidationStatus::Pending;
            }
        }

        let mut manager = Self {
            rows,
            active_row: snapshot.active_row_id,
            timeline: snapshot.activation_timeline,
            row_height: snapshot.row_height,
            clock,
            events,
        };
        if manager.rows.is_empty() {
            manager.reset();
        } else if manager.active_row.is_none() {
            manager.activate(RowId(0));
        }
        Ok(manager)
    }

    /// Store a validation verdict
    pub(crate) fn record_validation(
        &mut self,
        id: RowId,
        result: std::result::Result<ValidationResult, PipelineError>,
    ) -> Result<RowUpdate> {
        let patch = match result {
            Ok(result) => {
                let status = if result.equivalent {
                    ValidationStatus::Validated
                } else {
                    ValidationStatus::Invalid
                };
                RowPatch::validation(status)
                    .with_result(Some(result))
                    .with_error(None)
            }
            Err(e) => RowPatch::validation(ValidationStatus::Error)
                .with_result(None)
                .with_error(Some(e.to_string())),
        };
        self.update_row(id, patch)
    }
}

fn check_snapshot(snapshot: &DocumentSnapshot) -> std::result::Result<(), String> {
    if snapshot.version != DOCUMENT_VERSION {
        return Err(format!("unsupported document version {}", snapshot.version));
    }
    if snapshot.row_height == 0 {
        return Err("row height must be positive".to_string());
    }

    for (index, row) in snapshot.rows.iter().enumerate() {
        if row.id.index() != index {
            return Err(format!("row at position {} has id {}", index, row.id));
        }
        let y_start = row.id.0 * snapshot.row_height;
        if row.y_start != y_start || row.y_end != y_start + snapshot.row_height {
            return Err(format!("{} has band {}..{}", row.id, row.y_start, row.y_end));
        }
    }

    let active: Vec<RowId> = snapshot
        .rows
        .iter()
        .filter(|r| r.is_active)
        .map(|r| r.id)
        .collect();
    match (active.as_slice(), snapshot.active_row_id) {
        ([], None) => {}
        ([id], Some(pointer)) if *id == pointer => {}
        _ => {
            return Err(format!(
                "active flags {:?} disagree with active row {:?}",
                active, snapshot.active_row_id
            ))
        }
    }

    let mut last: Option<DateTime<Utc>> = None;
    for event in &snapshot.activation_timeline {
        if event.row_id.index() >= snapshot.rows.len() {
            return Err(format!("timeline refers to unknown {}", event.row_id));
        }
        if last.is_some_and(|t| event.activated_at < t) {
            return Err("activation timeline is not ordered".to_string());
        }
        last = Some(event.activated_at);
    }

    // Only the active row's activation may be open, and it is the latest
    let open: Vec<RowId> = snapshot
        .activation_timeline
        .iter()
        .filter(|e| e.deactivated_at.is_none())
        .map(|e| e.row_id)
        .collect();
    let latest_open = snapshot
        .activation_timeline
        .last()
        .filter(|e| e.deactivated_at.is_none())
        .map(|e| e.row_id);
    let consistent = match snapshot.active_row_id {
        Some(active) => open.len() == 1 && latest_open == Some(active),
        None => open.is_empty(),
    };
    if !consistent {
        return Err(format!(
            "open timeline entries {:?} disagree with active row {:?}",
            open, snapshot.active_row_id
        ));
    }

    Ok(())
}
