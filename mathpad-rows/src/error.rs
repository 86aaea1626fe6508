//! Error types for mathpad-rows
//!
//! Tile-level errors are retried locally where the pool allows it; everything
//! that survives to a row is rendered into that row's `error_message` and
//! never crosses into another row's pipeline.

use crate::models::RowId;
use thiserror::Error;

/// Row pipeline error taxonomy
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    /// Per-tile recognition or per-row equivalence call exceeded its deadline
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Recognition worker faulted twice on the same task
    #[error("Recognition worker crashed: {0}")]
    WorkerCrash(String),

    /// Recognition queue at capacity; task rejected
    #[error("Recognition queue full ({0} tasks waiting)")]
    QueueFull(usize),

    /// Recognition service reported a model error or malformed output
    #[error("Recognition failed: {0}")]
    RecognitionFailed(String),

    /// Task belonged to a row whose recognition was cancelled
    #[error("Recognition cancelled for {0}")]
    Cancelled(RowId),

    /// Reconstructed expression is not syntactically valid
    #[error("Invalid merged expression: {0}")]
    InvalidMerge(String),

    /// Equivalence service could not parse one side
    #[error("Parse failure: {0}")]
    ParseFailure(String),

    /// Equivalence service failed for any other reason
    #[error("Equivalence service error: {0}")]
    EquivalenceServiceError(String),

    /// A persisted cache entry could not be decoded
    #[error("Corrupt cache entry: {0}")]
    CacheCorrupt(String),

    /// The persisted document could not be decoded
    #[error("Persisted state corrupt: {0}")]
    PersistedStateCorrupt(String),

    /// Row content extends beyond its band
    #[error("Content spans {height}px but the row band is {band}px high")]
    ContentOutsideBand { height: u32, band: u32 },

    #[error("Row not found: {0}")]
    RowNotFound(RowId),

    /// Update rejected before any field was written
    #[error("Malformed row update: {0}")]
    MalformedUpdate(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<mathpad_common::Error> for PipelineError {
    fn from(err: mathpad_common::Error) -> Self {
        match err {
            mathpad_common::Error::Serialization(e) => {
                PipelineError::PersistedStateCorrupt(e.to_string())
            }
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

/// Convenience Result type using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;
