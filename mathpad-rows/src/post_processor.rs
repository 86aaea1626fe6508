//! Post-processing of merged recognition output
//!
//! Rule-based cleanup applied after merging:
//! 1. Visually similar symbols mapped to their ASCII operator
//! 2. Letter/digit confusions resolved from neighbouring characters
//! 3. Whitespace normalized around structural tokens
//! 4. Grouping symbols checked for balance (reported, not repaired)
//!
//! Cleaning never fails; the worst case is the input returned unchanged with
//! a warning. The cleaned text is then re-checked with the expression parser.

use crate::merger::MergeOutcome;
use crate::services::SyntaxValidator;
use std::sync::Arc;
use tracing::debug;

const OPENERS: &[char] = &['(', '[', '{'];
const CLOSERS: &[char] = &[')', ']', '}'];

/// Output of `PostProcessor::clean`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CleanOutcome {
    pub cleaned: String,
    pub warnings: Vec<String>,
}

/// Final expression for a row after cleanup and re-validation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessedExpression {
    pub expression: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct PostProcessor {
    validator: Arc<dyn SyntaxValidator>,
}

impl PostProcessor {
    pub fn new(validator: Arc<dyn SyntaxValidator>) -> Self {
        Self { validator }
    }

    /// Clean merged text; deterministic and infallible
    pub fn clean(&self, text: &str) -> CleanOutcome {
        let mut warnings = Vec::new();

        let mut chars: Vec<char> = text.chars().map(normalize_symbol).collect();
        disambiguate(&mut chars, &mut warnings);
        let cleaned = normalize_spacing(&chars);

        if let Some(problem) = check_balance(&cleaned) {
            warnings.push(format!("unbalanced grouping symbols: {}", problem));
        }

        if cleaned.is_empty() && !text.trim().is_empty() {
            warnings.push("cleanup produced empty output; keeping input".to_string());
            return CleanOutcome {
                cleaned: text.to_string(),
                warnings,
            };
        }

        if !warnings.is_empty() {
            debug!(
                input = %text,
                cleaned = %cleaned,
                warnings = warnings.len(),
                "Cleaned merged text"
            );
        }
        CleanOutcome { cleaned, warnings }
    }

    /// Clean a merge result and re-check its syntax
    pub fn process(&self, merged: MergeOutcome) -> ProcessedExpression {
        if merged.text.is_empty() {
            return ProcessedExpression {
                valid: true,
                ..Default::default()
            };
        }

        let CleanOutcome { cleaned, warnings } = self.clean(&merged.text);
        match self.validator.parse(&cleaned) {
            Ok(()) => ProcessedExpression {
                expression: cleaned,
                valid: true,
                errors: Vec::new(),
                warnings,
            },
            Err(diagnostic) => {
                let mut errors = merged.errors;
                errors.push(diagnostic);
                ProcessedExpression {
                    expression: cleaned,
                    valid: false,
                    errors,
                    warnings,
                }
            }
        }
    }
}

fn normalize_symbol(c: char) -> char {
    match c {
        '\u{2212}' | '\u{2013}' | '\u{2014}' => '-',
        '\u{00d7}' | '\u{22c5}' | '\u{00b7}' | '\u{2217}' => '*',
        '\u{00f7}' => '/',
        '\u{00a0}' | '\u{2009}' => ' ',
        other => other,
    }
}

fn neighbour(chars: &[char], from: usize, forward: bool) -> Option<char> {
    if forward {
        chars[from + 1..].iter().copied().find(|c| !c.is_whitespace())
    } else {
        chars[..from].iter().rev().copied().find(|c| !c.is_whitespace())
    }
}

/// Function names written without a backslash
const FUNCTION_NAMES: &[&str] = &[
    "log", "ln", "lim", "sin", "cos", "tan", "sec", "csc", "cot", "exp", "min", "max",
];

fn digit_lookalike(c: char) -> Option<(char, bool)> {
    // (digit, needs digits on both sides)
    match c {
        'O' | 'o' => Some(('0', false)),
        'l' | 'I' => Some(('1', false)),
        'S' => Some(('5', true)),
        'Z' => Some(('2', true)),
        _ => None,
    }
}

/// Replace letters that read as digits when their neighbours are numeric
fn disambiguate(chars: &mut [char], warnings: &mut Vec<String>) {
    for i in 0..chars.len() {
        let Some((digit, strict)) = digit_lookalike(chars[i]) else {
            continue;
        };
        // Skip LaTeX command names like \log, \lim
        let run_start = chars[..i]
            .iter()
            .rposition(|c| !c.is_alphabetic())
            .map_or(0, |p| p + 1);
        if run_start > 0 && chars[run_start - 1] == '\\' {
            continue;
        }
        // and bare function names like 2log x
        let run_end = chars[i..]
            .iter()
            .position(|c| !c.is_alphabetic())
            .map_or(chars.len(), |p| i + p);
        let word: String = chars[run_start..run_end].iter().collect();
        if FUNCTION_NAMES.iter().any(|name| word.contains(name)) {
            continue;
        }

        let prev = neighbour(chars, i, false);
        let next = neighbour(chars, i, true);
        let is_digit = |c: Option<char>| c.is_some_and(|c| c.is_ascii_digit());
        let blocks = |c: Option<char>| {
            c.is_some_and(|c| c.is_alphabetic() && digit_lookalike(c).is_none())
        };

        let numeric = if strict {
            is_digit(prev) && is_digit(next)
        } else {
            (is_digit(prev) || is_digit(next)) && !blocks(prev) && !blocks(next)
        };

        if numeric {
            warnings.push(format!(
                "read '{}' as '{}' at position {}",
                chars[i], digit, i
            ));
            chars[i] = digit;
        }
    }
}

fn is_operand_end(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, ')' | ']' | '}' | '!' | '.' | '\'')
}

#[derive(Clone, Copy, PartialEq)]
enum After {
    Free,
    Space,
    NoSpace,
}

/// Collapse whitespace and space binary operators uniformly
///
/// `=` and `<`/`>` and binary `+`/`-` get one space on each side; unary
/// signs hug their operand; no space inside brackets or around `^`/`_`.
fn normalize_spacing(chars: &[char]) -> String {
    let mut out = String::with_capacity(chars.len());
    let mut pending_space = false;
    let mut after = After::Free;

    for &c in chars {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }

        let last = out.chars().last();
        let continues_relation = c == '=' && matches!(last, Some('<' | '>' | '!'));
        let binary = match c {
            '=' | '<' | '>' => !continues_relation,
            '+' | '-' => last.is_some_and(is_operand_end),
            _ => false,
        };
        let unary = matches!(c, '+' | '-') && !binary;

        let space_before = if continues_relation {
            false
        } else if binary {
            true
        } else if CLOSERS.contains(&c) || matches!(c, '^' | '_' | '{') {
            false
        } else {
            match after {
                After::Space => true,
                After::NoSpace => false,
                After::Free => {
                    pending_space
                        && !last.is_some_and(|l| OPENERS.contains(&l) || matches!(l, '^' | '_'))
                }
            }
        };

        if space_before && !out.is_empty() && !out.ends_with(' ') {
            out.push(' ');
        }
        out.push(c);

        after = if binary || continues_relation {
            After::Space
        } else if unary {
            After::NoSpace
        } else {
            After::Free
        };
        pending_space = false;
    }

    out
}

/// First grouping problem found, if any
fn check_balance(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if OPENERS.contains(&c) {
            stack.push(c);
        } else if let Some(pos) = CLOSERS.iter().position(|&x| x == c) {
            match stack.pop() {
                Some(open) if open == OPENERS[pos] => {}
                Some(open) => return Some(format!("'{}' closed by '{}'", open, c)),
                None => return Some(format!("unmatched '{}'", c)),
            }
        }
    }

    stack.last().map(|open| format!("unclosed '{}'", open))
}
