//! Per-run accumulator of completed node responses, keyed by alias.
//!
//! The context is a value: `add` returns a new context and leaves the
//! receiver untouched, so a snapshot handed to an in-flight node never
//! changes underneath it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::http::HttpResponse;

#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    responses: Arc<HashMap<String, Arc<HttpResponse>>>,
}

impl FlowContext {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add(&self, alias: impl Into<String>, response: HttpResponse) -> FlowContext {
        let mut responses: HashMap<String, Arc<HttpResponse>> = (*self.responses).clone();
        responses.insert(alias.into(), Arc::new(response));
        FlowContext {
            responses: Arc::new(responses),
        }
    }

    pub fn get(&self, alias: &str) -> Option<&HttpResponse> {
        self.responses.get(alias).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Bindings for the given placeholder references, restricted to
    /// `upstream_aliases`. Only the referenced paths are extracted. A body is
    /// parsed at most once, and only when a reference reads it.
    pub fn to_variable_source(
        &self,
        upstream_aliases: &HashSet<String>,
        references: &[String],
    ) -> HashMap<String, String> {
        self.bindings_with(upstream_aliases, references, HttpResponse::json_body)
    }

    fn bindings_with(
        &self,
        upstream_aliases: &HashSet<String>,
        references: &[String],
        mut parse: impl FnMut(&HttpResponse) -> Option<Value>,
    ) -> HashMap<String, String> {
        let mut bindings = HashMap::new();
        let mut parsed: HashMap<&str, Option<Value>> = HashMap::new();

        for reference in references {
            let (alias, path) = match reference.split_once('.') {
                Some((alias, path)) => (alias, path),
                None => (reference.as_str(), ""),
            };
            if !upstream_aliases.contains(alias) {
                continue;
            }
            let Some(response) = self.responses.get(alias) else {
                continue;
            };
            let body = if reads_body(path) {
                parsed.entry(alias).or_insert_with(|| parse(response)).as_ref()
            } else {
                None
            };
            if let Some(value) = extract(response, body, path) {
                bindings.insert(reference.clone(), value_to_string(&value));
            }
        }
        bindings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let (name, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !name.is_empty() {
            segments.push(Segment::Key(name.to_string()));
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let index = rest.get(1..close)?.trim().parse().ok()?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    Some(segments)
}

/// Look up `path` (e.g. `body.items[0].id`, `status`, `headers.etag`)
/// within a response.
pub fn lookup(response: &HttpResponse, path: &str) -> Option<Value> {
    let body = if reads_body(path) { response.json_body() } else { None };
    extract(response, body.as_ref(), path)
}

/// Whether `path` resolves against the response body.
fn reads_body(path: &str) -> bool {
    match path.strip_prefix("body") {
        Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with('['),
        None => path.is_empty(),
    }
}

fn extract(response: &HttpResponse, body: Option<&Value>, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(body.cloned().unwrap_or_else(|| Value::String(response.body.clone())));
    }
    let segments = parse_path(path)?;
    let (head, rest) = segments.split_first()?;
    let Segment::Key(head) = head else {
        return None;
    };

    match head.as_str() {
        "status" if rest.is_empty() => Some(Value::from(response.status)),
        "statusText" if rest.is_empty() => Some(Value::String(response.status_text.clone())),
        "time" | "elapsedMs" if rest.is_empty() => Some(Value::from(response.elapsed_ms)),
        "headers" => match rest {
            [] => serde_json::to_value(&response.headers).ok(),
            [Segment::Key(name)] => response.header(name).map(|v| Value::String(v.to_string())),
            _ => None,
        },
        "body" => match body {
            Some(json) => navigate(json, rest).cloned(),
            None if rest.is_empty() => Some(Value::String(response.body.clone())),
            None => None,
        },
        _ => None,
    }
}

fn navigate<'a>(mut current: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Strings render bare; everything else renders as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
