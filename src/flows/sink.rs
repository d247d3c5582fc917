//! Where the executor publishes live run state.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::broadcast;

use super::history::{FlowRunResult, RunStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub is_running: bool,
    pub result: FlowRunResult,
    pub running_node_ids: Vec<String>,
}

impl RunState {
    pub fn snapshot(result: &FlowRunResult) -> Self {
        Self {
            is_running: result.status == RunStatus::Running,
            running_node_ids: result.running_node_ids(),
            result: result.clone(),
        }
    }
}

pub trait RunStateSink: Send + Sync {
    /// Called after initialization and after every node completion.
    fn publish(&self, flow_id: &str, state: &RunState);

    fn clear(&self, _flow_id: &str) {}
}

/// Latest state per flow id.
#[derive(Default)]
pub struct InMemoryRunStates {
    states: RwLock<HashMap<String, RunState>>,
}

impl InMemoryRunStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, flow_id: &str) -> Option<RunState> {
        self.states.read().ok()?.get(flow_id).cloned()
    }
}

impl RunStateSink for InMemoryRunStates {
    fn publish(&self, flow_id: &str, state: &RunState) {
        if let Ok(mut states) = self.states.write() {
            states.insert(flow_id.to_string(), state.clone());
        }
    }

    fn clear(&self, flow_id: &str) {
        if let Ok(mut states) = self.states.write() {
            states.remove(flow_id);
        }
    }
}

/// Publishes every snapshot on a broadcast channel. Lagging receivers drop
/// old snapshots.
pub struct BroadcastRunStates {
    tx: broadcast::Sender<(String, RunState)>,
}

impl BroadcastRunStates {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, RunState)> {
        self.tx.subscribe()
    }
}

impl RunStateSink for BroadcastRunStates {
    fn publish(&self, flow_id: &str, state: &RunState) {
        // No receivers is fine.
        let _ = self.tx.send((flow_id.to_string(), state.clone()));
    }
}
