use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub flow_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub node_id: Option<String>,
    pub event_type: RunEventType,
    pub message: String,
}

impl RunEvent {
    pub fn new(
        flow_id: &str,
        run_id: &str,
        node_id: Option<&str>,
        event_type: RunEventType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            node_id: node_id.map(str::to_string),
            event_type,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunStarted,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventType::RunStarted => "run_started",
            RunEventType::NodeStarted => "node_started",
            RunEventType::NodeCompleted => "node_completed",
            RunEventType::NodeFailed => "node_failed",
            RunEventType::NodeSkipped => "node_skipped",
            RunEventType::RunCompleted => "run_completed",
            RunEventType::RunFailed => "run_failed",
            RunEventType::RunCancelled => "run_cancelled",
        }
    }
}
