//! Sandboxed band-math expressions.
//!
//! Compute tiles combine several bands with a user expression such as
//! `(v2 - v1) / (v2 + v1)`. User text is untrusted, so evaluation runs in
//! three stages:
//!
//! 1. [`parser`] turns the text into a generic syntax tree.
//! 2. [`ast::lower`] converts it into the closed [`Expr`] grammar, rejecting
//!    every other construct and resolving names and functions.
//! 3. [`eval`] evaluates the tree elementwise.
//!
//! A wall-clock [`Budget`] is checked at every node in stages 2 and 3.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use ndarray::array;
//! use rastertile::expr::ExpressionSandbox;
//!
//! let sandbox = ExpressionSandbox::default();
//! let operands = HashMap::from([
//!     ("v1".to_string(), array![[1.0, 2.0]]),
//!     ("v2".to_string(), array![[3.0, 2.0]]),
//! ]);
//! let ndvi = sandbox.evaluate("(v2 - v1) / (v2 + v1)", &operands).unwrap();
//! assert_eq!(ndvi, array![[0.5, 0.0]]);
//! ```

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod parser;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ndarray::Array2;
use tracing::debug;

use crate::error::ExpressionError;

pub use ast::{BinaryOp, CompareOp, Expr, Function};
pub use eval::Value;
pub use parser::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_NODES};

/// Default wall-clock budget for one evaluation.
pub const DEFAULT_EXPRESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Wall-clock budget shared by lowering and evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: Instant,
    timeout: Duration,
}

impl Budget {
    pub fn start(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    /// Fail with [`ExpressionError::Timeout`] once the budget is spent.
    pub fn check(&self) -> Result<(), ExpressionError> {
        if self.started.elapsed() > self.timeout {
            return Err(ExpressionError::Timeout(self.timeout.as_millis()));
        }
        Ok(())
    }
}

/// Restricted evaluator for band-math expressions.
#[derive(Debug, Clone)]
pub struct ExpressionSandbox {
    timeout: Duration,
    max_depth: usize,
    max_nodes: usize,
}

impl Default for ExpressionSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_EXPRESSION_TIMEOUT)
    }
}

impl ExpressionSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_depth: DEFAULT_MAX_DEPTH,
            max_nodes: DEFAULT_MAX_NODES,
        }
    }

    /// Override the nesting and size limits.
    pub fn with_limits(mut self, max_depth: usize, max_nodes: usize) -> Self {
        self.max_depth = max_depth;
        self.max_nodes = max_nodes;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parse and validate `text` without evaluating it.
    ///
    /// Identifiers resolve against `operand_names` and the constant table.
    pub fn compile(
        &self,
        text: &str,
        operand_names: &[&str],
    ) -> Result<Expr, ExpressionError> {
        let budget = Budget::start(self.timeout);
        self.compile_within(text, &|name| operand_names.iter().any(|n| *n == name), &budget)
    }

    fn compile_within(
        &self,
        text: &str,
        is_operand: &dyn Fn(&str) -> bool,
        budget: &Budget,
    ) -> Result<Expr, ExpressionError> {
        let syntax = parser::parse(text, self.max_depth, self.max_nodes)?;
        budget.check()?;
        ast::lower(&syntax, is_operand, budget)
    }

    /// Evaluate `text` elementwise over `operands`.
    ///
    /// # Errors
    /// Every rejection happens before any operand is read: parse errors,
    /// disallowed syntax, unknown names or functions, and arity mismatches.
    /// Evaluation can then fail on shape mismatches, a scalar result, or
    /// an exhausted time budget.
    pub fn evaluate(
        &self,
        text: &str,
        operands: &HashMap<String, Array2<f64>>,
    ) -> Result<Array2<f64>, ExpressionError> {
        let budget = Budget::start(self.timeout);
        let expr = self.compile_within(text, &|name| operands.contains_key(name), &budget)?;

        let result = eval::evaluate(&expr, operands, &budget);
        debug!(
            expression = text,
            elapsed_ms = budget.started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Evaluated expression"
        );

        match result? {
            Value::Array(array) => Ok(array),
            Value::BoolArray(array) => Ok(array.mapv(|b| f64::from(u8::from(b)))),
            Value::Number(_) | Value::Boolean(_) => Err(ExpressionError::ScalarResult),
        }
    }
}

/// Evaluate with a one-off sandbox using `timeout`.
pub fn evaluate(
    text: &str,
    operands: &HashMap<String, Array2<f64>>,
    timeout: Duration,
) -> Result<Array2<f64>, ExpressionError> {
    ExpressionSandbox::new(timeout).evaluate(text, operands)
}

// =============================================================================
// Tests
// =============================================================================
