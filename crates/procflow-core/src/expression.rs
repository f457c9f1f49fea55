//! JEXL condition evaluator for step `condition` clauses.
//!
//! Conditions are JEXL expressions in which `$name` references a workflow
//! variable, mirroring the `$name` syntax of step inputs. Before evaluation
//! the expression is lowered: each `$name` outside a string literal becomes
//! a `vars.name` lookup against the evaluation context, and every referenced
//! root variable is checked for presence. Referencing a variable that is not
//! bound is an error (the step fails permanently); a missing *path* inside a
//! bound variable evaluates to `null` per JEXL semantics.
//!
//! Conditions must be pure: the engine evaluates each one exactly once, at
//! the moment the step is considered, and assumes re-evaluation against an
//! unchanged context would yield the same result.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during condition evaluation.
///
/// All of these are treated as a permanent failure of the step that carries
/// the condition; none are retried.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("condition evaluation failed: {0}")]
    EvalFailed(String),

    #[error("condition references unbound variable '{name}'")]
    UnboundVariable { name: String },

    #[error("invalid evaluation context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for step `condition` clauses, e.g.:
/// - `$report.size > 0`
/// - `$body|length > 120 && $strict`
/// - `vars|exists('override') ? $override : true`
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!js_truthy(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            // Presence check: `vars|exists('name')`. The only way to probe
            // for a variable without tripping the unbound-reference check.
            .with_transform("exists", |args: &[Value]| {
                let present = match (args.first(), args.get(1)) {
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(present))
            });

        Self { evaluator }
    }

    /// Evaluate a step condition against an execution context.
    ///
    /// The `context` must be an object with a `vars` object (the current
    /// variable snapshot) and may carry a `workflow` object with run
    /// metadata. `$name` references are lowered to `vars.name` lookups;
    /// every referenced root variable must be present in `vars` or the
    /// evaluation fails with [`ExpressionError::UnboundVariable`].
    pub fn evaluate_condition(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        let vars = context
            .get("vars")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                ExpressionError::InvalidContext("context must contain a 'vars' object".to_string())
            })?;

        let (lowered, references) = lower_condition(expression);
        for name in &references {
            if !vars.contains_key(name) {
                return Err(ExpressionError::UnboundVariable { name: name.clone() });
            }
        }

        self.evaluate_bool(&lowered, context)
    }

    /// Evaluate an already-lowered expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Expression results are coerced
    /// to boolean using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(js_truthy(&result))
    }

    /// Evaluate an already-lowered expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn js_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Condition lowering
// ---------------------------------------------------------------------------

/// Root variable names referenced by a condition via `$name`.
///
/// Sorted and deduplicated. References inside string literals are ignored,
/// as is any `$` not followed by a valid identifier or preceded by an
/// identifier character. Bracket lookups (`vars['x']`) and the `exists`
/// transform are not counted as references.
pub fn condition_variables(expression: &str) -> Vec<String> {
    lower_condition(expression).1
}

/// Lower `$name` references to `vars.name` lookups.
///
/// Returns the rewritten expression together with the sorted, deduplicated
/// set of referenced root variables. The scan is quote-aware: `$` inside
/// single- or double-quoted literals is left alone, as are backslash
/// escapes within them.
fn lower_condition(expression: &str) -> (String, Vec<String>) {
    let bytes = expression.as_bytes();
    let mut lowered = String::with_capacity(expression.len() + 16);
    let mut references = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && i + 1 < bytes.len() {
                    let escaped_len = 1 + utf8_len(bytes[i + 1]);
                    lowered.push_str(&expression[i..i + escaped_len]);
                    i += escaped_len;
                    continue;
                }
                if b == q {
                    quote = None;
                }
                let ch_len = utf8_len(b);
                lowered.push_str(&expression[i..i + ch_len]);
                i += ch_len;
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                    lowered.push(b as char);
                    i += 1;
                } else if b == b'$' && !prev_is_ident(bytes, i) {
                    match leading_identifier(&expression[i + 1..]) {
                        Some(name) => {
                            lowered.push_str("vars.");
                            lowered.push_str(name);
                            references.push(name.to_string());
                            i += 1 + name.len();
                        }
                        None => {
                            // Bare '$'; leave it for the parser to reject.
                            lowered.push('$');
                            i += 1;
                        }
                    }
                } else {
                    // Multi-byte UTF-8 sequences pass through unchanged.
                    let ch_len = utf8_len(b);
                    lowered.push_str(&expression[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
    }

    references.sort();
    references.dedup();
    (lowered, references)
}

fn prev_is_ident(bytes: &[u8], i: usize) -> bool {
    i > 0 && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_')
}

fn leading_identifier(s: &str) -> Option<&str> {
    let first = s.chars().next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    Some(&s[..end])
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
