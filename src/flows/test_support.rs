//! Builders and test doubles shared by the flow tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::history::{FlowNodeResult, NodeStatus};
use super::sink::{RunState, RunStateSink};
use super::{Condition, Flow, FlowConnector, FlowNode};
use crate::catalog::{Collection, RequestBody, RequestCatalog, RequestTemplate, find_in_collections};
use crate::environments::{AuthProfile, CredentialStore, Environment, Variable};
use crate::http::{HttpExecutor, HttpResponse, RequestConfig};

pub fn flow(nodes: Vec<FlowNode>, connectors: Vec<FlowConnector>) -> Flow {
    Flow {
        id: "flow-1".to_string(),
        name: "Test flow".to_string(),
        nodes,
        connectors,
        default_env_id: None,
        default_auth_id: None,
    }
}

pub fn node(id: &str) -> FlowNode {
    node_with_request(id, id, id)
}

pub fn node_with_request(id: &str, request_id: &str, alias: &str) -> FlowNode {
    FlowNode {
        id: id.to_string(),
        request_id: request_id.to_string(),
        alias: alias.to_string(),
    }
}

pub fn connector(id: &str, source: &str, target: &str) -> FlowConnector {
    FlowConnector {
        id: id.to_string(),
        source_node_id: source.to_string(),
        target_node_id: target.to_string(),
        condition: None,
    }
}

pub fn conditional(id: &str, source: &str, target: &str, condition: Condition) -> FlowConnector {
    FlowConnector {
        condition: Some(condition),
        ..connector(id, source, target)
    }
}

pub fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        status_text: String::new(),
        headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
        body: body.to_string(),
        elapsed_ms: 12,
    }
}

pub fn result_with(status: NodeStatus, response: Option<HttpResponse>) -> FlowNodeResult {
    FlowNodeResult {
        node_id: "src".to_string(),
        request_id: "src".to_string(),
        alias: "src".to_string(),
        status,
        response,
        error: None,
        started_at: None,
        completed_at: None,
    }
}

pub fn get(id: &str, url: &str) -> RequestTemplate {
    RequestTemplate {
        id: id.to_string(),
        name: id.to_string(),
        method: "GET".to_string(),
        url: url.to_string(),
        headers: vec![],
        params: vec![],
        body: RequestBody::default(),
        auth_id: None,
    }
}

// --- In-memory workspace ---

#[derive(Default)]
pub struct MemoryWorkspace {
    pub collections: Vec<Collection>,
    pub globals: Vec<Variable>,
    pub environments: Vec<Environment>,
    pub auths: Vec<AuthProfile>,
}

impl MemoryWorkspace {
    /// Add a request to the `default.json` collection.
    pub fn add_request(&mut self, request: RequestTemplate) {
        match self.collections.iter_mut().find(|c| c.id == "default") {
            Some(collection) => collection.requests.push(request),
            None => self.collections.push(Collection {
                id: "default".to_string(),
                file: "default.json".to_string(),
                name: "Default".to_string(),
                requests: vec![request],
            }),
        }
    }
}

impl RequestCatalog for MemoryWorkspace {
    fn find(&self, collection: Option<&str>, item_id: &str) -> Option<RequestTemplate> {
        find_in_collections(&self.collections, collection, item_id)
    }
}

impl CredentialStore for MemoryWorkspace {
    fn globals(&self) -> Vec<Variable> {
        self.globals.clone()
    }
    fn environment(&self, id: &str) -> Option<Environment> {
        self.environments.iter().find(|e| e.id == id).cloned()
    }
    fn auth_profile(&self, id: &str) -> Option<AuthProfile> {
        self.auths.iter().find(|a| a.id == id).cloned()
    }
}

// --- Scripted HttpExecutor ---

enum Reply {
    Respond(HttpResponse),
    Fail(String),
}

/// Replies by URL. Unknown URLs answer 404. A gated URL holds its request
/// in flight until `open` is called for it.
#[derive(Default)]
pub struct ScriptedHttp {
    replies: StdMutex<HashMap<String, Reply>>,
    gates: StdMutex<HashMap<String, Arc<Notify>>>,
    calls: StdMutex<Vec<RequestConfig>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Respond(response(status, body)));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Fail(message.to_string()));
    }

    pub fn gate(&self, url: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::new(Notify::new()));
    }

    pub fn open(&self, url: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(url) {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> Vec<RequestConfig> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.url).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until a request for `url` has been issued.
    pub async fn wait_started(&self, url: &str) {
        let url = url.to_string();
        eventually(|| self.called_urls().contains(&url)).await;
    }
}

#[async_trait]
impl HttpExecutor for ScriptedHttp {
    async fn execute(&self, request: &RequestConfig) -> anyhow::Result<HttpResponse> {
        self.calls.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(&request.url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.replies.lock().unwrap().get(&request.url) {
            Some(Reply::Respond(r)) => Ok(r.clone()),
            Some(Reply::Fail(message)) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(HttpResponse {
                status_text: "Not Found".to_string(),
                ..response(404, "")
            }),
        }
    }
}

// --- Recording sink ---

#[derive(Default)]
pub struct RecordingSink {
    pub states: StdMutex<Vec<RunState>>,
}

impl RecordingSink {
    pub fn states(&self) -> Vec<RunState> {
        self.states.lock().unwrap().clone()
    }
}

impl RunStateSink for RecordingSink {
    fn publish(&self, _flow_id: &str, state: &RunState) {
        self.states.lock().unwrap().push(state.clone());
    }
}

/// Poll `condition` until it holds, yielding to the runtime in between.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..2_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met in time");
}
