//! `{{placeholder}}` expansion.
//!
//! Lookup order for a reference: environment variables, then flow
//! bindings (`<alias>.<path>` values extracted from upstream responses),
//! then the built-in dynamic variables. A reference that matches none of
//! them is left in place and reported, never an error.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: String,
    pub unresolved: Vec<String>,
}

/// Placeholder references in `template`, trimmed, in first-seen order.
pub fn references(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    scan(template, |name| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        None
    });
    names
}

pub fn resolve(
    template: &str,
    env_vars: &HashMap<String, String>,
    flow_bindings: &HashMap<String, String>,
) -> Resolution {
    let mut unresolved: Vec<String> = Vec::new();
    let resolved = scan(template, |name| {
        let value = env_vars
            .get(name)
            .or_else(|| flow_bindings.get(name))
            .cloned()
            .or_else(|| dynamic_variable(name));
        if value.is_none() && !unresolved.iter().any(|n| n == name) {
            unresolved.push(name.to_string());
        }
        value
    });
    Resolution { resolved, unresolved }
}

fn dynamic_variable(name: &str) -> Option<String> {
    match name {
        "$timestamp" => Some(Utc::now().timestamp().to_string()),
        "$isoTimestamp" => Some(Utc::now().to_rfc3339()),
        "$guid" | "$uuid" => Some(Uuid::new_v4().to_string()),
        _ => None,
    }
}

/// Walk every `{{name}}` in `template`. The callback returns the
/// replacement; `None` keeps the original placeholder text. Replacement
/// text is never rescanned.
fn scan<F>(template: &str, mut replace: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let raw = &after_open[..close];
        let name = raw.trim();
        let placeholder = &rest[open..open + 2 + close + 2];

        if name.is_empty() || raw.contains('{') || raw.contains('}') {
            // Not a placeholder; emit one brace and keep scanning after it.
            out.push('{');
            rest = &rest[open + 1..];
            continue;
        }

        match replace(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(placeholder),
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    out
}
