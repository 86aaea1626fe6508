//! Test doubles for the services the row pipeline consumes
//!
//! - ScriptedRecognizer: fragment chosen by the tile-local x of the first ink point
//! - StubEquivalence: equivalent when the expressions match ignoring spaces
//! - BalancedValidator: accepts ASCII text with balanced parentheses

#![allow(dead_code)]

use async_trait::async_trait;
use mathpad_common::config::PipelineConfig;
use mathpad_common::ManualClock;
use mathpad_rows::models::{
    ComparisonSettings, Point, RowContent, Stroke, TileImage, ValidationMethod,
};
use mathpad_rows::services::{
    EquivalenceError, EquivalenceOutcome, EquivalenceService, Recognition, Recognizer,
    RecognizerError, SyntaxValidator,
};
use mathpad_rows::{RowPipeline, Services};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct ScriptedRecognizer {
    script: HashMap<i32, String>,
    delay: Duration,
    /// Delay of the n-th call; later calls use `delay`
    call_delays: Vec<Duration>,
    /// Calls before this one fail with a model error
    failures: u32,
    pub started: AtomicU32,
    pub calls: AtomicU32,
}

impl ScriptedRecognizer {
    pub fn new(script: &[(i32, &str)]) -> Self {
        Self {
            script: script
                .iter()
                .map(|(x, fragment)| (*x, fragment.to_string()))
                .collect(),
            delay: Duration::ZERO,
            call_delays: Vec::new(),
            failures: 0,
            started: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_call_delays(mut self, delays: &[Duration]) -> Self {
        self.call_delays = delays.to_vec();
        self
    }

    pub fn failing_first(mut self, calls: u32) -> Self {
        self.failures = calls;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn recognize(&self, image: TileImage) -> Result<Recognition, RecognizerError> {
        let call = self.started.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .call_delays
            .get(call as usize)
            .copied()
            .unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RecognizerError::Model("smudged ink".to_string()));
        }

        let Some(first) = image.strokes.first().and_then(|s| s.points.first()) else {
            return Ok(Recognition {
                fragment: String::new(),
                confidence: 1.0,
            });
        };
        let key = first.x.round() as i32;
        match self.script.get(&key) {
            Some(fragment) => Ok(Recognition {
                fragment: fragment.clone(),
                confidence: 0.95,
            }),
            None => Err(RecognizerError::Model(format!("unknown glyph at x={key}"))),
        }
    }
}

pub struct StubEquivalence {
    pub calls: AtomicU32,
}

impl StubEquivalence {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl EquivalenceService for StubEquivalence {
    async fn check_equivalence(
        &self,
        a: &str,
        b: &str,
        _settings: &ComparisonSettings,
    ) -> Result<EquivalenceOutcome, EquivalenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let canon = |s: &str| s.replace(' ', "");
        Ok(EquivalenceOutcome {
            equivalent: canon(a) == canon(b),
            method: ValidationMethod::FastPath,
            time_ms: 1,
            canonical_a: Some(canon(a)),
            canonical_b: Some(canon(b)),
        })
    }
}

pub struct BalancedValidator;

impl SyntaxValidator for BalancedValidator {
    fn parse(&self, text: &str) -> Result<(), String> {
        let mut depth = 0i32;
        for c in text.chars() {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                c if !c.is_ascii() => return Err(format!("unexpected symbol '{c}'")),
                _ => {}
            }
            if depth < 0 {
                return Err("unexpected ')'".to_string());
            }
        }
        if depth == 0 {
            Ok(())
        } else {
            Err("missing ')'".to_string())
        }
    }
}

/// Fragments for the three-tile row built by `three_tile_content`
pub const THREE_TILE_SCRIPT: &[(i32, &str)] = &[(0, "x^2 + 3x"), (80, "y + y^2"), (70, "- 5")];

/// 800px of ink in row `row`, one stroke per tile (tiles at 0, 320, 640)
pub fn three_tile_content(row: u32) -> RowContent {
    let y = row as f32 * 384.0 + 10.0;
    RowContent::new(vec![
        Stroke::line(Point::new(0.0, y), Point::new(100.0, y + 10.0)),
        Stroke::line(Point::new(400.0, y), Point::new(600.0, y + 10.0)),
        Stroke::line(Point::new(710.0, y), Point::new(800.0, y + 10.0)),
    ])
}

/// One stroke of `width` px starting at x=0; a single centered tile
///
/// The tile-local x of the first point is `(384 - width) / 2`.
pub fn narrow_content(row: u32, width: f32) -> RowContent {
    let y = row as f32 * 384.0 + 10.0;
    RowContent::new(vec![Stroke::line(
        Point::new(0.0, y),
        Point::new(width, y + 10.0),
    )])
}

pub struct Harness {
    pub pipeline: RowPipeline,
    pub recognizer: Arc<ScriptedRecognizer>,
    pub equivalence: Arc<StubEquivalence>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(recognizer: ScriptedRecognizer) -> Harness {
    harness_with_config(recognizer, PipelineConfig::default())
}

pub fn harness_with_config(recognizer: ScriptedRecognizer, config: PipelineConfig) -> Harness {
    let recognizer = Arc::new(recognizer);
    let equivalence = Arc::new(StubEquivalence::new());
    let clock = Arc::new(ManualClock::default());
    let pipeline = RowPipeline::new(
        config,
        Services {
            recognizer: recognizer.clone(),
            equivalence: equivalence.clone(),
            validator: Arc::new(BalancedValidator),
        },
        clock.clone(),
    );
    Harness {
        pipeline,
        recognizer,
        equivalence,
        clock,
    }
}
