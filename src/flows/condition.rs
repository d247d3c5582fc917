//! Connector activation predicates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::{lookup, value_to_string};
use super::history::{FlowNodeResult, NodeStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    StatusEquals { status: u16 },
    StatusNotEquals { status: u16 },
    StatusInRange { min: u16, max: u16 },
    BodyContains { text: String },
    /// `path` is relative to the response, e.g. `body.user.role` or `status`.
    JsonPathEquals { path: String, value: Value },
    HeaderEquals { name: String, value: String },
    HeaderExists { name: String },
    ResponseTimeBelow { ms: u64 },
}

impl Condition {
    /// A connector only activates from a source that succeeded, so skips and
    /// failures never unlock downstream nodes.
    pub fn evaluate(&self, source: &FlowNodeResult) -> bool {
        if source.status != NodeStatus::Success {
            return false;
        }
        let Some(response) = source.response.as_ref() else {
            return matches!(self, Condition::Always);
        };

        match self {
            Condition::Always => true,
            Condition::StatusEquals { status } => response.status == *status,
            Condition::StatusNotEquals { status } => response.status != *status,
            Condition::StatusInRange { min, max } => (*min..=*max).contains(&response.status),
            Condition::BodyContains { text } => response.body.contains(text.as_str()),
            Condition::JsonPathEquals { path, value } => match lookup(response, path) {
                Some(actual) => values_equal(&actual, value),
                None => value.is_null(),
            },
            Condition::HeaderEquals { name, value } => response.header(name) == Some(value.as_str()),
            Condition::HeaderExists { name } => response.header(name).is_some(),
            Condition::ResponseTimeBelow { ms } => response.elapsed_ms < *ms,
        }
    }
}

/// Evaluate an optional connector condition; a missing condition is `Always`.
pub fn connector_active(condition: Option<&Condition>, source: &FlowNodeResult) -> bool {
    condition.unwrap_or(&Condition::Always).evaluate(source)
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        // "200" and 200 compare equal, as they would in a form-built condition.
        (Value::String(_), _) | (_, Value::String(_)) => value_to_string(actual) == value_to_string(expected),
        _ => false,
    }
}
