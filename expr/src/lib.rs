//! Safe, non-Turing-complete predicate and template engine.
//!
//! Hook conditions are parsed once at registration time into a small AST and
//! evaluated against a JSON context at each checkpoint. The language has
//! literals, dotted paths, comparison/boolean/arithmetic operators, and
//! parentheses. No function calls, no attribute access beyond dotted paths,
//! no imports.

mod eval;
mod lexer;
mod parser;
mod template;

use serde_json::Value;
use thiserror::Error;

pub use template::substitute;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("evaluation error: {0}")]
    Eval(String),
}

/// A parsed predicate expression.
///
/// Parsing is the static-validation point: a malformed hook condition is
/// rejected here, before the harness ever runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root: parser::Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = lexer::lex(source)?;
        let root = parser::parse(&tokens)?;
        Ok(Self { root })
    }

    /// Evaluate to a JSON value. Missing paths resolve to null.
    pub fn eval(&self, context: &Value) -> Result<Value, ExprError> {
        eval::eval(&self.root, context)
    }

    /// Evaluate as a predicate: the result's truthiness.
    pub fn matches(&self, context: &Value) -> Result<bool, ExprError> {
        Ok(eval::is_truthy(&self.eval(context)?))
    }
}

/// Resolve a dotted path against a context value. Missing segments → null.
#[must_use]
pub fn resolve_path(context: &Value, path: &str) -> Value {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}
