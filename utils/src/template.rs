//! `${VAR}` and `${VAR:-default}` expansion.
//!
//! Used for subprocess command/arg templating and runtime env tables. A
//! reference to an unknown variable with no default is left literal so the
//! failure is visible downstream instead of silently becoming empty.

use std::collections::BTreeMap;

/// Expansion passes over an env table before giving up on self-references.
const MAX_EXPANSION_PASSES: usize = 8;

/// Expand every `${VAR}` / `${VAR:-default}` in `input` via `lookup`.
pub fn expand_str(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; emit the remainder untouched.
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &after[..end];
        let (name, default) = match body.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (body, None),
        };
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => match default {
                Some(default) => out.push_str(default),
                None => {
                    out.push_str("${");
                    out.push_str(body);
                    out.push('}');
                }
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

/// Expand a declared env table over a base environment.
///
/// Declared entries may reference base variables and each other; expansion
/// iterates to a fixpoint (bounded) so declaration order does not matter.
#[must_use]
pub fn expand_map(
    declared: &BTreeMap<String, String>,
    base: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut resolved: BTreeMap<String, String> = declared.clone();

    for _ in 0..MAX_EXPANSION_PASSES {
        let mut changed = false;
        let snapshot = resolved.clone();
        for (key, value) in &mut resolved {
            let expanded = expand_str(value, |name| {
                if name == key {
                    // Self-reference resolves against the base only.
                    return base.get(name).cloned();
                }
                snapshot.get(name).cloned().or_else(|| base.get(name).cloned())
            });
            if expanded != *value {
                *value = expanded;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    resolved
}
