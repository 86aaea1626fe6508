//! Fragment merging
//!
//! Rebuilds one row expression from ordered tile outputs. Spacing between
//! fragments follows the measured horizontal gap between tiles; operators
//! duplicated across a tile seam are collapsed.

use crate::models::OrderedTileResult;
use crate::services::SyntaxValidator;
use std::sync::Arc;
use tracing::debug;

/// Gap below which fragments are joined directly (overlapping tiles included)
pub const TIGHT_GAP_PX: i32 = 10;
/// Gap at or above which fragments get a double space
pub const WIDE_GAP_PX: i32 = 30;

const SEAM_OPERATORS: &[char] = &['+', '-', '*', '/', '='];

/// Result of merging one row
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MergeOutcome {
    pub text: String,
    pub valid: bool,
    /// Parser diagnostics when `valid` is false
    pub errors: Vec<String>,
}

impl MergeOutcome {
    /// Row without ink
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Separator for a measured gap between two tiles
pub fn gap_separator(gap: i32) -> &'static str {
    if gap < TIGHT_GAP_PX {
        ""
    } else if gap < WIDE_GAP_PX {
        " "
    } else {
        "  "
    }
}

/// Horizontal space between the right edge of `prev` and the left edge of `next`
pub fn tile_gap(prev: &OrderedTileResult, next: &OrderedTileResult) -> i32 {
    next.tile.offset_x - prev.tile.end_x()
}

fn canonical_operator(c: char) -> Option<char> {
    let c = match c {
        '\u{2212}' | '\u{2013}' => '-',
        '\u{00d7}' | '\u{22c5}' => '*',
        '\u{00f7}' => '/',
        other => other,
    };
    SEAM_OPERATORS.contains(&c).then_some(c)
}

/// Append `fragment` to `acc`, dropping an operator repeated across the seam
fn join_at_seam(acc: &mut String, separator: &str, fragment: &str) {
    let left = acc.trim_end().chars().last().and_then(canonical_operator);
    let trimmed = fragment.trim_start();
    let mut right_chars = trimmed.chars();
    let right = right_chars.next().and_then(canonical_operator);

    match (left, right) {
        (Some(l), Some(r)) if l == r => {
            debug!(operator = %l, "Collapsing operator duplicated across tile seam");
            acc.push_str(separator);
            acc.push_str(right_chars.as_str());
        }
        _ => {
            acc.push_str(separator);
            acc.push_str(fragment);
        }
    }
}

/// Reassembles tile fragments and checks the result with the expression parser
pub struct FragmentMerger {
    validator: Arc<dyn SyntaxValidator>,
}

impl FragmentMerger {
    pub fn new(validator: Arc<dyn SyntaxValidator>) -> Self {
        Self { validator }
    }

    pub fn validator(&self) -> &Arc<dyn SyntaxValidator> {
        &self.validator
    }

    /// Concatenate fragments in tile order with gap-based spacing
    ///
    /// Blank fragments contribute nothing; the next gap is then measured from
    /// the last tile that produced text.
    pub fn join(&self, tiles: &[OrderedTileResult]) -> String {
        let mut text = String::new();
        let mut last: Option<&OrderedTileResult> = None;

        for current in tiles {
            let fragment = current.result.fragment.as_str();
            if fragment.trim().is_empty() {
                continue;
            }
            match last {
                None => text.push_str(fragment.trim_start()),
                Some(prev) => {
                    let separator = gap_separator(tile_gap(prev, current));
                    join_at_seam(&mut text, separator, fragment)
                }
            }
            last = Some(current);
        }

        text.trim_end().to_string()
    }

    /// Merge tiles (ordered by `offset_x`) into one expression
    ///
    /// An unparseable result is reported through `valid`/`errors`, never as an error.
    pub fn merge(&self, tiles: &[OrderedTileResult]) -> MergeOutcome {
        debug_assert!(
            tiles.windows(2).all(|w| w[0].tile.offset_x <= w[1].tile.offset_x),
            "tiles must arrive in offset order"
        );

        let text = self.join(tiles);
        if text.is_empty() {
            return MergeOutcome::empty();
        }

        match self.validator.parse(&text) {
            Ok(()) => MergeOutcome {
                text,
                valid: true,
                errors: Vec::new(),
            },
            Err(diagnostic) => {
                debug!(text = %text, diagnostic = %diagnostic, "Merged text failed to parse");
                MergeOutcome {
                    text,
                    valid: false,
                    errors: vec![diagnostic],
                }
            }
        }
    }
}
