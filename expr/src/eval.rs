//! Tree-walking evaluation over a JSON context.

use serde_json::Value;

use crate::parser::{BinaryOp, Expr, UnaryOp};
use crate::{ExprError, resolve_path};

/// Truthiness: null, false, 0, "", and empty containers are false.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval_err(message: impl Into<String>) -> ExprError {
    ExprError::Eval(message.into())
}

fn as_number(value: &Value, side: &str) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| eval_err(format!("{side} operand is not a number: {value}")))
}

fn number(n: f64) -> Result<Value, ExprError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| eval_err(format!("arithmetic produced a non-finite number: {n}")))
}

/// Loose equality: numbers compare numerically, everything else structurally.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(op: BinaryOp, a: &Value, b: &Value) -> Result<bool, ExprError> {
    // Strings order lexicographically; numbers numerically.
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(match op {
            BinaryOp::Lt => x < y,
            BinaryOp::Gt => x > y,
            BinaryOp::Le => x <= y,
            BinaryOp::Ge => x >= y,
            _ => unreachable!("compare called with non-ordering op"),
        });
    }
    let x = as_number(a, "left")?;
    let y = as_number(b, "right")?;
    Ok(match op {
        BinaryOp::Lt => x < y,
        BinaryOp::Gt => x > y,
        BinaryOp::Le => x <= y,
        BinaryOp::Ge => x >= y,
        _ => unreachable!("compare called with non-ordering op"),
    })
}

fn contains(needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(eval_err(format!(
                "'in' over a string needs a string needle, got {other}"
            ))),
        },
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(eval_err(format!(
                "'in' over an object needs a string key, got {other}"
            ))),
        },
        other => Err(eval_err(format!("'in' is not defined over {other}"))),
    }
}

pub fn eval(expr: &Expr, context: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(resolve_path(context, path)),
        Expr::Unary { op, operand } => {
            let value = eval(operand, context)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => number(-as_number(&value, "negated")?),
            }
        }
        Expr::Binary { op, lhs, rhs } => match op {
            // Short-circuit forms evaluate the right side lazily.
            BinaryOp::And => {
                let left = eval(lhs, context)?;
                if !is_truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&eval(rhs, context)?)))
            }
            BinaryOp::Or => {
                let left = eval(lhs, context)?;
                if is_truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&eval(rhs, context)?)))
            }
            BinaryOp::Eq => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                Ok(Value::Bool(values_equal(&a, &b)))
            }
            BinaryOp::Ne => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                Ok(Value::Bool(!values_equal(&a, &b)))
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                Ok(Value::Bool(compare(*op, &a, &b)?))
            }
            BinaryOp::In => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                Ok(Value::Bool(contains(&a, &b)?))
            }
            BinaryOp::NotIn => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                Ok(Value::Bool(!contains(&a, &b)?))
            }
            BinaryOp::Add => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                // '+' doubles as string concatenation.
                if let (Value::String(x), Value::String(y)) = (&a, &b) {
                    return Ok(Value::String(format!("{x}{y}")));
                }
                number(as_number(&a, "left")? + as_number(&b, "right")?)
            }
            BinaryOp::Sub => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                number(as_number(&a, "left")? - as_number(&b, "right")?)
            }
            BinaryOp::Mul => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                number(as_number(&a, "left")? * as_number(&b, "right")?)
            }
            BinaryOp::Div => {
                let (a, b) = (eval(lhs, context)?, eval(rhs, context)?);
                let divisor = as_number(&b, "right")?;
                if divisor == 0.0 {
                    return Err(eval_err("division by zero"));
                }
                number(as_number(&a, "left")? / divisor)
            }
        },
    }
}
