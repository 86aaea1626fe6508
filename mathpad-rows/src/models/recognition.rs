//! Tile and recognition types, including the worker task protocol

use super::{RowId, Stroke};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One overlapping crop of a row, the unit of recognition input
///
/// Ephemeral: produced fresh per recognition cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub row_id: RowId,
    pub tile_index: u32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub width: u32,
    pub height: u32,
    pub overlap_px: u32,
    /// Fingerprint of the tile-local content; recognition cache key
    pub content_hash: String,
}

impl Tile {
    pub fn id(&self) -> String {
        format!("{}:t{:02}", self.row_id, self.tile_index)
    }

    /// Right edge in document coordinates
    pub fn end_x(&self) -> i32 {
        self.offset_x + self.width as i32
    }
}

/// Content of one tile in tile-local coordinates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileImage {
    pub width: u32,
    pub height: u32,
    pub strokes: Vec<Stroke>,
}

/// Output of recognizing one tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    pub tile_id: String,
    pub fragment: String,
    pub confidence: f32,
    pub duration_ms: u64,
}

/// A tile paired with its recognition output, in submission order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedTileResult {
    pub tile: Tile,
    pub result: RecognitionResult,
}

/// Request sent to a recognition worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub task_id: Uuid,
    pub tile_id: String,
    pub image_data: TileImage,
}

/// Failure classes a worker can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerErrorKind {
    Timeout,
    Crash,
    ModelError,
    MalformedOutput,
}

/// Reply from a recognition worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerResponse {
    #[serde(rename_all = "camelCase")]
    Success {
        task_id: Uuid,
        tile_id: String,
        fragment: String,
        confidence: f32,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        task_id: Uuid,
        tile_id: String,
        error_kind: WorkerErrorKind,
        message: String,
    },
}

impl WorkerResponse {
    pub fn task_id(&self) -> Uuid {
        match self {
            WorkerResponse::Success { task_id, .. } | WorkerResponse::Failure { task_id, .. } => {
                *task_id
            }
        }
    }
}
