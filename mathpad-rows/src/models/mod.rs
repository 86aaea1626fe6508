//! Data models for the row pipeline

pub mod content;
pub mod recognition;
pub mod row;
pub mod validation;

pub use content::{BoundingBox, Point, RowContent, Stroke};
pub use mathpad_common::events::{OcrStatus, RowId, ValidationMethod, ValidationStatus};
pub use recognition::{
    OrderedTileResult, RecognitionResult, Tile, TileImage, WorkerErrorKind, WorkerRequest,
    WorkerResponse,
};
pub use row::{ActivationEvent, Row, RowPatch};
pub use validation::{ComparisonSettings, ValidationResult};
