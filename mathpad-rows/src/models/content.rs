//! Ink content handed over by the drawing surface

use mathpad_common::hash::ContentHasher;
use serde::{Deserialize, Serialize};

/// One sampled pen position in document coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A continuous pen-down path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub points: Vec<Point>,
}

impl Stroke {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Straight stroke between two points, handy for synthetic content
    pub fn line(from: Point, to: Point) -> Self {
        Self {
            points: vec![from, to],
        }
    }
}

/// Integer pixel bounds of a row's ink
///
/// Integral so tile boundaries derived from it are exactly reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl BoundingBox {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> u32 {
        (self.max_x - self.min_x).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.max_y - self.min_y).max(0) as u32
    }
}

/// All strokes currently drawn inside one row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowContent {
    pub strokes: Vec<Stroke>,
}

impl RowContent {
    pub fn new(strokes: Vec<Stroke>) -> Self {
        Self { strokes }
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.iter().all(|s| s.points.is_empty())
    }

    /// Bounds of all points, rounded outward to whole pixels
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut points = self.strokes.iter().flat_map(|s| s.points.iter());
        let first = points.next()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in points {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(BoundingBox::new(
            min_x.floor() as i32,
            min_y.floor() as i32,
            max_x.ceil() as i32,
            max_y.ceil() as i32,
        ))
    }

    /// Fingerprint of the whole row, used to detect edits on deactivation
    pub fn content_hash(&self) -> String {
        let mut hasher = ContentHasher::new();
        hasher.u64(self.strokes.len() as u64);
        for stroke in &self.strokes {
            hasher.u64(stroke.points.len() as u64);
            for p in &stroke.points {
                hasher.u64(p.x.to_bits() as u64).u64(p.y.to_bits() as u64);
            }
        }
        hasher.finish()
    }
}
