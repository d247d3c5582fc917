use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Flow, FlowNode};
use crate::http::HttpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    /// Ready, but waiting for a free slot (sequential runs).
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Failed | NodeStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNodeResult {
    pub node_id: String,
    pub request_id: String,
    pub alias: String,
    pub status: NodeStatus,
    pub response: Option<HttpResponse>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl FlowNodeResult {
    pub fn idle(node: &FlowNode) -> Self {
        Self {
            node_id: node.id.clone(),
            request_id: node.request_id.clone(),
            alias: node.alias.clone(),
            status: NodeStatus::Idle,
            response: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRunResult {
    pub run_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    pub node_results: BTreeMap<String, FlowNodeResult>,
    pub active_connector_ids: BTreeSet<String>,
    pub skipped_connector_ids: BTreeSet<String>,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl FlowRunResult {
    /// A fresh run with every node idle.
    pub fn new(flow: &Flow, run_id: String) -> Self {
        let node_results: BTreeMap<String, FlowNodeResult> = flow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), FlowNodeResult::idle(n)))
            .collect();
        let mut result = Self {
            run_id,
            flow_id: flow.id.clone(),
            status: RunStatus::Running,
            node_results,
            active_connector_ids: BTreeSet::new(),
            skipped_connector_ids: BTreeSet::new(),
            progress: Progress::default(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        result.refresh_progress();
        result
    }

    pub fn node(&self, node_id: &str) -> Option<&FlowNodeResult> {
        self.node_results.get(node_id)
    }

    pub fn refresh_progress(&mut self) {
        let mut progress = Progress {
            total: self.node_results.len(),
            ..Progress::default()
        };
        for result in self.node_results.values() {
            match result.status {
                NodeStatus::Success => progress.succeeded += 1,
                NodeStatus::Failed => progress.failed += 1,
                NodeStatus::Skipped => progress.skipped += 1,
                _ => {}
            }
        }
        progress.completed = progress.succeeded + progress.failed + progress.skipped;
        self.progress = progress;
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self.refresh_progress();
    }

    pub fn running_node_ids(&self) -> Vec<String> {
        self.node_results
            .values()
            .filter(|r| r.status == NodeStatus::Running)
            .map(|r| r.node_id.clone())
            .collect()
    }
}
