//! mathpad-rows library
//!
//! Row pipeline for handwritten math: rows with an activation timeline,
//! tiled recognition on a bounded worker pool, fragment merging and cleanup,
//! and sequential cached equivalence checks between consecutive rows.

pub mod cache;
pub mod error;
pub mod merger;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod post_processor;
pub mod row_manager;
pub mod scheduler;
pub mod services;
pub mod tiles;
pub mod validation;
pub mod worker_pool;

pub use crate::error::{PipelineError, Result};
pub use crate::pipeline::{LoadReport, OcrRun, RowPipeline, Services};
pub use crate::row_manager::{DocumentSnapshot, RowManager};
