//! `${path}` template substitution over JSON values.
//!
//! A string that is exactly one template resolves to the referenced value
//! with its type preserved; mixed strings stringify each resolved value in
//! place. Substitution recurses through objects and arrays.

use serde_json::Value;

use crate::resolve_path;

/// Substitute every `${a.b.c}` in `input` against `context`.
#[must_use]
pub fn substitute(input: &Value, context: &Value) -> Value {
    match input {
        Value::String(s) => substitute_str(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, context: &Value) -> Value {
    // Whole-string template: preserve the resolved value's type.
    if let Some(path) = exact_template(s) {
        return resolve_path(context, path);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Value::String(out);
        };
        let path = &after[..end];
        out.push_str(&stringify(&resolve_path(context, path)));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Value::String(out)
}

fn exact_template(s: &str) -> Option<&str> {
    let body = s.strip_prefix("${")?.strip_suffix('}')?;
    // Reject "${a} and ${b}" which contains an interior brace pair.
    if body.contains('{') || body.contains('}') {
        return None;
    }
    Some(body)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
