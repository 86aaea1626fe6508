//! Overlapping tile extraction
//!
//! Splits a row's ink into fixed-size, horizontally overlapping tiles. All
//! arithmetic is integral: identical content always yields identical tile
//! boundaries and hashes, which the recognition cache depends on.

use crate::error::{PipelineError, Result};
use crate::models::{BoundingBox, Point, Row, RowContent, Stroke, Tile, TileImage};
use mathpad_common::config::PipelineConfig;
use mathpad_common::hash::ContentHasher;
use tracing::debug;

/// Tile geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileExtractor {
    tile_size: u32,
    overlap: u32,
}

impl TileExtractor {
    /// `overlap` must be smaller than `tile_size`; PipelineConfig::validate enforces it
    pub fn new(tile_size: u32, overlap: u32) -> Self {
        Self {
            tile_size,
            overlap: overlap.min(tile_size.saturating_sub(1)),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.tile_size, config.tile_overlap)
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn overlap(&self) -> u32 {
        self.overlap
    }

    pub fn stride(&self) -> u32 {
        self.tile_size - self.overlap
    }

    /// Left edges of the tiles covering `bbox`
    ///
    /// Content no wider than one tile gets a single tile centered on it;
    /// wider content gets `ceil((width - overlap) / stride)` tiles starting at
    /// the left edge.
    pub fn tile_offsets(&self, bbox: &BoundingBox) -> Vec<i32> {
        let width = bbox.width();
        if width <= self.tile_size {
            let slack = (self.tile_size - width) as i32;
            return vec![bbox.min_x - slack / 2];
        }

        let stride = self.stride();
        let count = (width - self.overlap).div_ceil(stride);
        (0..count)
            .map(|i| bbox.min_x + (i * stride) as i32)
            .collect()
    }

    /// Cut a row's content into tiles with their tile-local images
    ///
    /// Empty content yields no tiles. Content reaching outside the row band
    /// is rejected rather than tiled.
    pub fn extract_tiles(&self, row: &Row, content: &RowContent) -> Result<Vec<(Tile, TileImage)>> {
        let bbox = match content.bounding_box() {
            Some(bbox) => bbox,
            None => return Ok(Vec::new()),
        };

        if bbox.min_y < row.y_start as i32 || bbox.max_y > row.y_end as i32 {
            return Err(PipelineError::ContentOutsideBand {
                height: bbox.height(),
                band: row.height(),
            });
        }

        let tiles: Vec<(Tile, TileImage)> = self
            .tile_offsets(&bbox)
            .into_iter()
            .enumerate()
            .map(|(index, offset_x)| {
                let image = self.crop(content, offset_x, row.y_start as i32, row.height());
                let tile = Tile {
                    row_id: row.id,
                    tile_index: index as u32,
                    offset_x,
                    offset_y: row.y_start as i32,
                    width: self.tile_size,
                    height: row.height(),
                    overlap_px: self.overlap,
                    content_hash: image_hash(&image),
                };
                (tile, image)
            })
            .collect();

        debug!(
            row_id = %row.id,
            width = bbox.width(),
            tiles = tiles.len(),
            "Extracted tiles"
        );
        Ok(tiles)
    }

    /// Clip strokes to `[offset_x, offset_x + tile_size]` and translate to tile space
    ///
    /// A stroke leaving and re-entering the tile becomes separate strokes.
    fn crop(&self, content: &RowContent, offset_x: i32, offset_y: i32, height: u32) -> TileImage {
        let left = offset_x as f32;
        let right = (offset_x + self.tile_size as i32) as f32;
        let mut strokes = Vec::new();

        for stroke in &content.strokes {
            let mut run: Vec<Point> = Vec::new();
            for p in &stroke.points {
                if p.x >= left && p.x <= right {
                    run.push(Point::new(p.x - left, p.y - offset_y as f32));
                } else if !run.is_empty() {
                    strokes.push(Stroke::new(std::mem::take(&mut run)));
                }
            }
            if !run.is_empty() {
                strokes.push(Stroke::new(run));
            }
        }

        TileImage {
            width: self.tile_size,
            height,
            strokes,
        }
    }
}

/// Fingerprint of a tile's rendered content
///
/// Position independent: the same glyphs in another row or at another x
/// offset hash identically, so they share one recognition.
pub fn image_hash(image: &TileImage) -> String {
    let mut hasher = ContentHasher::new();
    hasher
        .u64(image.width as u64)
        .u64(image.height as u64)
        .u64(image.strokes.len() as u64);
    for stroke in &image.strokes {
        hasher.u64(stroke.points.len() as u64);
        for p in &stroke.points {
            hasher.u64(p.x.to_bits() as u64).u64(p.y.to_bits() as u64);
        }
    }
    hasher.finish()
}
