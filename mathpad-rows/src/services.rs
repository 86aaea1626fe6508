//! Consumed service contracts
//!
//! The recognition model, the symbolic equivalence engine and the expression
//! parser live outside this crate. The pipeline only sees these traits.

use crate::models::{ComparisonSettings, TileImage, ValidationMethod};
use async_trait::async_trait;
use thiserror::Error;

/// Raw output of the recognition model for one tile
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub fragment: String,
    pub confidence: f32,
}

/// Recognition failures the model reports itself
///
/// Timeouts and crashes are detected by the worker pool, not reported here.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecognizerError {
    #[error("model error: {0}")]
    Model(String),
    #[error("malformed output: {0}")]
    MalformedOutput(String),
}

/// Handwriting-to-expression model
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: TileImage) -> Result<Recognition, RecognizerError>;
}

/// Verdict from the equivalence engine
#[derive(Debug, Clone, PartialEq)]
pub struct EquivalenceOutcome {
    pub equivalent: bool,
    pub method: ValidationMethod,
    pub time_ms: u64,
    pub canonical_a: Option<String>,
    pub canonical_b: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EquivalenceError {
    /// One side could not be parsed
    #[error("could not parse {0}")]
    Parse(String),
    /// Any other failure, including the engine's own fallback path
    #[error("{0}")]
    Service(String),
}

/// Symbolic equivalence engine
#[async_trait]
pub trait EquivalenceService: Send + Sync {
    async fn check_equivalence(
        &self,
        expr_a: &str,
        expr_b: &str,
        settings: &ComparisonSettings,
    ) -> Result<EquivalenceOutcome, EquivalenceError>;
}

/// Expression parser used to check well-formedness
pub trait SyntaxValidator: Send + Sync {
    /// `Err` carries the parser's diagnostic
    fn parse(&self, text: &str) -> Result<(), String>;
}
