//! Event types for the mathpad event system
//!
//! Provides shared event definitions and the EventBus used by the row pipeline.

mod row_types;

pub use row_types::{OcrStatus, RowId, ValidationMethod, ValidationStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Row pipeline events
///
/// Broadcast via EventBus and serializable for any outer surface that wants
/// to mirror row state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RowEvent {
    /// A row was appended to the document
    RowCreated {
        row_id: RowId,
        y_start: u32,
        y_end: u32,
        timestamp: DateTime<Utc>,
    },

    /// A row became the active row
    RowActivated {
        row_id: RowId,
        timestamp: DateTime<Utc>,
    },

    /// The active row lost focus
    RowDeactivated {
        row_id: RowId,
        /// Whether the content changed since the last recognition
        content_changed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Recognition state changed
    OcrStatusChanged {
        row_id: RowId,
        old_status: OcrStatus,
        new_status: OcrStatus,
        error_message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Validation state changed
    ValidationStatusChanged {
        row_id: RowId,
        old_status: ValidationStatus,
        new_status: ValidationStatus,
        method: Option<ValidationMethod>,
        timestamp: DateTime<Utc>,
    },

    /// A persisted document replaced the in-memory one
    DocumentLoaded {
        row_count: usize,
        /// True when the persisted state was unreadable and an empty document was used
        recovered: bool,
        timestamp: DateTime<Utc>,
    },
}

impl RowEvent {
    /// Row the event refers to, if any
    pub fn row_id(&self) -> Option<RowId> {
        match self {
            RowEvent::RowCreated { row_id, .. }
            | RowEvent::RowActivated { row_id, .. }
            | RowEvent::RowDeactivated { row_id, .. }
            | RowEvent::OcrStatusChanged { row_id, .. }
            | RowEvent::ValidationStatusChanged { row_id, .. } => Some(*row_id),
            RowEvent::DocumentLoaded { .. } => None,
        }
    }
}

/// Central event distribution bus
///
/// Wraps a tokio broadcast channel. Slow subscribers lose the oldest events
/// rather than blocking emitters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RowEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RowEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: RowEvent) -> Result<usize, broadcast::error::SendError<RowEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: RowEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
