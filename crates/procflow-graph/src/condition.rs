use std::cmp::Ordering;

use procflow_core::ExecutionContext;
use serde_json::Value;

/// A parsed flow condition.
///
/// Supported expressions:
/// - `path == literal`, `path != literal`
/// - `path > literal`, `>=`, `<`, `<=` (numbers or strings)
/// - `path contains "substr"` (substring, or element of an array)
/// - `exists path`
/// - `!path`, `path` (truthiness)
///
/// Paths are dotted context lookups; literals are JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    Contains {
        path: String,
        needle: Value,
    },
    Exists(String),
    Truthy(String),
    Falsy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

// Longest first so `>=` is not read as `>`.
const OPERATORS: &[(&str, CompareOp)] = &[
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

impl Condition {
    /// Parse an expression. Errors describe what is wrong with it.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty condition".to_string());
        }

        if expr == "exists" {
            return Err(format!("missing variable path in '{}'", expr));
        }
        if let Some(rest) = expr.strip_prefix("exists ") {
            return Ok(Self::Exists(parse_path(rest.trim(), expr)?.to_string()));
        }
        if let Some(rest) = expr.strip_prefix('!') {
            return Ok(Self::Falsy(parse_path(rest.trim(), expr)?.to_string()));
        }

        let (path, rest) = split_path(expr);
        if path.is_empty() {
            return Err(format!("expected a variable path in '{}'", expr));
        }
        let rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(Self::Truthy(path.to_string()));
        }

        if let Some(literal) = rest.strip_prefix("contains") {
            if !literal.starts_with(char::is_whitespace) {
                return Err(format!("unknown operator in '{}'", expr));
            }
            return Ok(Self::Contains {
                path: path.to_string(),
                needle: parse_literal(literal, expr)?,
            });
        }

        for (symbol, op) in OPERATORS {
            if let Some(literal) = rest.strip_prefix(symbol) {
                return Ok(Self::Compare {
                    path: path.to_string(),
                    op: *op,
                    value: parse_literal(literal, expr)?,
                });
            }
        }

        Err(format!("unknown operator in '{}'", expr))
    }

    /// Evaluate against a context. A missing variable makes every
    /// comparison false.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match self {
            Self::Exists(path) => ctx.lookup(path).is_some(),
            Self::Truthy(path) => ctx.lookup(path).is_some_and(is_truthy),
            Self::Falsy(path) => !ctx.lookup(path).is_some_and(is_truthy),
            Self::Contains { path, needle } => match ctx.lookup(path) {
                Some(Value::String(s)) => needle.as_str().is_some_and(|n| s.contains(n)),
                Some(Value::Array(items)) => items.iter().any(|item| loosely_equal(item, needle)),
                _ => false,
            },
            Self::Compare { path, op, value } => {
                let Some(actual) = ctx.lookup(path) else {
                    return false;
                };
                match op {
                    CompareOp::Eq => loosely_equal(actual, value),
                    CompareOp::Ne => !loosely_equal(actual, value),
                    CompareOp::Gt => order(actual, value) == Some(Ordering::Greater),
                    CompareOp::Ge => matches!(
                        order(actual, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CompareOp::Lt => order(actual, value) == Some(Ordering::Less),
                    CompareOp::Le => matches!(
                        order(actual, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
        }
    }
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || c == '-'
}

/// Split a leading path token off the expression.
fn split_path(expr: &str) -> (&str, &str) {
    let end = expr.find(|c| !is_path_char(c)).unwrap_or(expr.len());
    expr.split_at(end)
}

fn parse_path<'a>(s: &'a str, expr: &str) -> Result<&'a str, String> {
    if s.is_empty() || !s.chars().all(is_path_char) {
        return Err(format!("invalid variable path in '{}'", expr));
    }
    Ok(s)
}

fn parse_literal(s: &str, expr: &str) -> Result<Value, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err(format!("missing literal in '{}'", expr));
    }
    serde_json::from_str(s).map_err(|_| format!("invalid literal '{}' in '{}'", s, expr))
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// JSON equality that treats `1` and `1.0` as the same number.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
