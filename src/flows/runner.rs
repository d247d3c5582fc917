use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tracing::Instrument;
use uuid::Uuid;

use super::condition::connector_active;
use super::context::FlowContext;
use super::error::{NodeError, ValidationError};
use super::events::{RunEvent, RunEventType};
use super::graph::{self, FlowGraph};
use super::history::{FlowNodeResult, FlowRunResult, NodeStatus, RunStatus};
use super::materializer::RequestMaterializer;
use super::sink::{RunState, RunStateSink};
use super::{Flow, FlowNode};
use crate::catalog::RequestCatalog;
use crate::environments::CredentialStore;
use crate::http::{HttpExecutor, HttpResponse};

/// Back-off while nothing is ready and nothing is in flight.
const IDLE_WAIT: Duration = Duration::from_millis(10);
const MAX_IDLE_ROUNDS: u32 = 50;

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Overrides the flow's default environment.
    pub environment_id: Option<String>,
    /// Overrides the flow's default auth profile.
    pub default_auth_id: Option<String>,
    /// `false` keeps at most one node in flight.
    pub parallel: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            environment_id: None,
            default_auth_id: None,
            parallel: true,
        }
    }
}

pub struct FlowExecutor {
    http: Arc<dyn HttpExecutor>,
    catalog: Arc<dyn RequestCatalog>,
    credentials: Arc<dyn CredentialStore>,
    sink: Option<Arc<dyn RunStateSink>>,
    events_tx: Option<broadcast::Sender<RunEvent>>,
    cancel: AtomicBool,
    current: Mutex<Option<FlowRunResult>>,
}

struct NodeOutcome<'f> {
    node: &'f FlowNode,
    response: Option<HttpResponse>,
    error: Option<NodeError>,
}

enum Readiness {
    Ready,
    Skip,
    Wait,
}

impl FlowExecutor {
    pub fn new(
        http: Arc<dyn HttpExecutor>,
        catalog: Arc<dyn RequestCatalog>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            http,
            catalog,
            credentials,
            sink: None,
            events_tx: None,
            cancel: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunStateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_events(mut self, events_tx: broadcast::Sender<RunEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Stop dispatching new nodes. In-flight requests finish and are recorded.
    pub fn cancel_flow(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        tracing::info!("cancel requested");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Forget the last run and clear it from the sink.
    pub fn reset_flow(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        let previous = self.current.lock().ok().and_then(|mut current| current.take());
        if let (Some(run), Some(sink)) = (previous, &self.sink) {
            sink.clear(&run.flow_id);
        }
    }

    pub fn node_result(&self, node_id: &str) -> Option<FlowNodeResult> {
        let current = self.current.lock().ok()?;
        current.as_ref()?.node(node_id).cloned()
    }

    pub fn current_run(&self) -> Option<FlowRunResult> {
        self.current.lock().ok()?.clone()
    }

    fn emit(&self, run: &FlowRunResult, node_id: Option<&str>, event_type: RunEventType, message: impl Into<String>) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(RunEvent::new(&run.flow_id, &run.run_id, node_id, event_type, message));
        }
    }

    fn publish(&self, run: &FlowRunResult) {
        let state = RunState::snapshot(run);
        if let Some(sink) = &self.sink {
            sink.publish(&run.flow_id, &state);
        }
        if let Ok(mut current) = self.current.lock() {
            *current = Some(state.result);
        }
    }

    pub async fn run_flow(&self, flow: &Flow, options: RunOptions) -> FlowRunResult {
        self.cancel.store(false, Ordering::SeqCst);
        let run_id = Uuid::new_v4().to_string();
        let short_id = run_id[..8].to_string();

        let span = tracing::info_span!("flow_run", flow = %flow.name, run = %short_id);
        tracing::info!(parent: &span, nodes = flow.nodes.len(), connectors = flow.connectors.len(), parallel = options.parallel, "▶ Started");

        let start = Instant::now();
        let run = self.execute(flow, run_id, &options).instrument(span.clone()).await;
        let elapsed = format!("{:.1}s", start.elapsed().as_secs_f64());

        match run.status {
            RunStatus::Success => {
                self.emit(&run, None, RunEventType::RunCompleted, format!("Completed in {elapsed}"));
                tracing::info!(parent: &span, elapsed = %elapsed, "✓ Completed");
            }
            RunStatus::Cancelled => {
                self.emit(&run, None, RunEventType::RunCancelled, "Run cancelled");
                tracing::warn!(parent: &span, elapsed = %elapsed, "■ Cancelled");
            }
            _ => {
                let err_msg = run.error.clone().unwrap_or_else(|| "unknown error".to_string());
                self.emit(&run, None, RunEventType::RunFailed, &err_msg);
                tracing::error!(parent: &span, elapsed = %elapsed, error = %err_msg, "✗ Failed");
            }
        }
        run
    }

    /// The scheduling loop. Nodes are dispatched as soon as their sources
    /// are terminal, and the loop wakes on the first completion rather than
    /// waiting for a whole level. Run state is only mutated here.
    async fn execute(&self, flow: &Flow, run_id: String, options: &RunOptions) -> FlowRunResult {
        let mut run = FlowRunResult::new(flow, run_id);
        self.emit(&run, None, RunEventType::RunStarted, format!("Flow execution started ({} nodes)", flow.nodes.len()));

        let problems = graph::validation_errors(flow);
        if !problems.is_empty() {
            let message: Vec<String> = problems.iter().map(ToString::to_string).collect();
            run.finish(RunStatus::Failed, Some(format!("invalid flow: {}", message.join("; "))));
            self.publish(&run);
            return run;
        }

        let graph = FlowGraph::new(flow);
        let Some(order) = graph.topological_order() else {
            run.finish(RunStatus::Failed, Some(ValidationError::Cycle.to_string()));
            self.publish(&run);
            return run;
        };
        self.publish(&run);

        let environment_id = options.environment_id.as_deref().or(flow.default_env_id.as_deref());
        let default_auth_id = options.default_auth_id.as_deref().or(flow.default_auth_id.as_deref());
        let slots = if options.parallel { usize::MAX } else { 1 };

        let mut pending: Vec<&FlowNode> = order;
        let mut context = FlowContext::empty();
        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;
        let mut idle_rounds = 0;

        loop {
            let stopped = halted || self.is_cancelled();

            if !stopped {
                let before = run.progress;
                let ready = self.scan_pending(&graph, &mut pending, &mut run);
                let mut dispatched = false;
                for node in ready {
                    if self.is_cancelled() {
                        break;
                    }
                    if in_flight.len() >= slots {
                        if let Some(result) = run.node_results.get_mut(&node.id) {
                            result.status = NodeStatus::Pending;
                        }
                        continue;
                    }
                    pending.retain(|n| n.id != node.id);
                    self.mark_running(node, &mut run);
                    dispatched = true;
                    in_flight.push(self.execute_node(&graph, node, context.clone(), environment_id, default_auth_id));
                }
                if dispatched || run.progress != before {
                    self.publish(&run);
                }
            }

            if in_flight.is_empty() {
                if stopped || pending.is_empty() || self.is_cancelled() {
                    break;
                }
                idle_rounds += 1;
                if idle_rounds > MAX_IDLE_ROUNDS {
                    self.strand(&pending, &mut run);
                    pending.clear();
                    break;
                }
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }
            idle_rounds = 0;

            if let Some(outcome) = in_flight.next().await {
                if self.record(&graph, outcome, &mut run, &mut context) {
                    halted = true;
                }
                self.publish(&run);
            }
        }

        // Nodes that were waiting for a slot never started.
        for result in run.node_results.values_mut() {
            if result.status == NodeStatus::Pending {
                result.status = NodeStatus::Idle;
            }
        }
        run.refresh_progress();

        let failed = run.progress.failed;
        if failed > 0 {
            run.finish(RunStatus::Failed, Some(format!("{failed} node(s) failed")));
        } else if self.is_cancelled() {
            run.finish(RunStatus::Cancelled, Some("run cancelled".to_string()));
        } else {
            run.finish(RunStatus::Success, None);
        }
        self.publish(&run);
        run
    }

    /// Mark every pending node whose sources are terminal but none of whose
    /// connectors hold as skipped, and return the nodes that can run.
    /// Pending nodes are in topological order, so skips cascade in one pass.
    fn scan_pending<'f>(
        &self,
        graph: &FlowGraph<'f>,
        pending: &mut Vec<&'f FlowNode>,
        run: &mut FlowRunResult,
    ) -> Vec<&'f FlowNode> {
        let mut ready = Vec::new();
        for node in pending.iter() {
            match readiness(graph, node, run) {
                Readiness::Ready => ready.push(*node),
                Readiness::Skip => self.mark_skipped(graph, node, run),
                Readiness::Wait => {}
            }
        }
        pending.retain(|n| run.node(&n.id).is_some_and(|r| r.status != NodeStatus::Skipped));
        ready
    }

    fn mark_skipped(&self, graph: &FlowGraph<'_>, node: &FlowNode, run: &mut FlowRunResult) {
        if let Some(result) = run.node_results.get_mut(&node.id) {
            result.status = NodeStatus::Skipped;
            result.completed_at = Some(Utc::now());
        }
        for connector in graph.incoming(&node.id) {
            run.skipped_connector_ids.insert(connector.id.clone());
        }
        let decisions: Vec<(String, bool)> = match run.node(&node.id) {
            Some(result) => graph
                .outgoing(&node.id)
                .iter()
                .map(|c| (c.id.clone(), connector_active(c.condition.as_ref(), result)))
                .collect(),
            None => Vec::new(),
        };
        record_connectors(run, decisions);
        run.refresh_progress();
        tracing::info!(node = %node.alias, "⊘ Node skipped");
        self.emit(run, Some(&node.id), RunEventType::NodeSkipped, "No incoming connector condition was met");
    }

    fn mark_running(&self, node: &FlowNode, run: &mut FlowRunResult) {
        if let Some(result) = run.node_results.get_mut(&node.id) {
            result.status = NodeStatus::Running;
            result.started_at = Some(Utc::now());
        }
        tracing::debug!(node = %node.alias, request = %node.request_id, "dispatching node");
        self.emit(run, Some(&node.id), RunEventType::NodeStarted, format!("Requesting {}...", node.alias));
    }

    fn strand(&self, pending: &[&FlowNode], run: &mut FlowRunResult) {
        for node in pending {
            if let Some(result) = run.node_results.get_mut(&node.id) {
                result.status = NodeStatus::Skipped;
                result.error = Some("dependencies never resolved".to_string());
                result.completed_at = Some(Utc::now());
            }
            tracing::warn!(node = %node.alias, "stranded node skipped");
        }
        run.refresh_progress();
    }

    /// Materialize and send one node's request. Runs concurrently with other
    /// nodes, so it only reads shared state.
    async fn execute_node<'f>(
        &self,
        graph: &FlowGraph<'f>,
        node: &'f FlowNode,
        context: FlowContext,
        environment_id: Option<&str>,
        default_auth_id: Option<&str>,
    ) -> NodeOutcome<'f> {
        let materializer = RequestMaterializer::new(self.catalog.as_ref(), self.credentials.as_ref());
        let request = match materializer.build_node_request(graph, node, &context, environment_id, default_auth_id) {
            Ok(request) => request,
            Err(error) => {
                return NodeOutcome {
                    node,
                    response: None,
                    error: Some(error),
                };
            }
        };

        match self.http.execute(&request).await {
            Ok(response) if response.is_success() => NodeOutcome {
                node,
                response: Some(response),
                error: None,
            },
            Ok(response) => NodeOutcome {
                node,
                error: Some(NodeError::Status {
                    status: response.status,
                    status_text: response.status_text.clone(),
                }),
                response: Some(response),
            },
            Err(e) => NodeOutcome {
                node,
                response: None,
                error: Some(NodeError::Transport(format!("{e:#}"))),
            },
        }
    }

    /// Fold a finished node into the run. Returns true when the node failed.
    fn record(
        &self,
        graph: &FlowGraph<'_>,
        outcome: NodeOutcome<'_>,
        run: &mut FlowRunResult,
        context: &mut FlowContext,
    ) -> bool {
        let NodeOutcome { node, response, error } = outcome;
        let err_msg = error.as_ref().map(ToString::to_string);
        let failed = err_msg.is_some();

        let Some(result) = run.node_results.get_mut(&node.id) else {
            return failed;
        };
        result.status = if failed { NodeStatus::Failed } else { NodeStatus::Success };
        result.error = err_msg.clone();
        result.response = response.clone();
        result.completed_at = Some(Utc::now());

        if !failed && let Some(response) = response.as_ref() {
            *context = context.add(node.alias.clone(), response.clone());
        }

        let decisions: Vec<(String, bool)> = graph
            .outgoing(&node.id)
            .iter()
            .map(|c| (c.id.clone(), connector_active(c.condition.as_ref(), result)))
            .collect();
        record_connectors(run, decisions);
        run.refresh_progress();

        match err_msg {
            Some(err_msg) => {
                tracing::error!(node = %node.alias, error = %err_msg, "✗ Node failed");
                self.emit(run, Some(&node.id), RunEventType::NodeFailed, err_msg);
            }
            None => {
                let summary = response
                    .as_ref()
                    .map(|r| format!("HTTP {} in {}ms", r.status, r.elapsed_ms))
                    .unwrap_or_else(|| "Done".to_string());
                tracing::info!(node = %node.alias, result = %summary, "✓ Node completed");
                self.emit(run, Some(&node.id), RunEventType::NodeCompleted, summary);
            }
        }
        failed
    }
}

fn record_connectors(run: &mut FlowRunResult, decisions: Vec<(String, bool)>) {
    for (connector_id, active) in decisions {
        if active {
            run.active_connector_ids.insert(connector_id);
        } else {
            run.skipped_connector_ids.insert(connector_id);
        }
    }
}

fn readiness(graph: &FlowGraph<'_>, node: &FlowNode, run: &FlowRunResult) -> Readiness {
    let incoming = graph.incoming(&node.id);
    if incoming.is_empty() {
        return Readiness::Ready;
    }
    let mut any_active = false;
    for connector in incoming {
        let Some(source) = run.node(&connector.source_node_id) else {
            return Readiness::Wait;
        };
        if !source.status.is_terminal() {
            return Readiness::Wait;
        }
        any_active |= connector_active(connector.condition.as_ref(), source);
    }
    if any_active { Readiness::Ready } else { Readiness::Skip }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::{Environment, Variable};
    use crate::flows::Condition;
    use crate::flows::sink::InMemoryRunStates;
    use crate::flows::test_support::{
        MemoryWorkspace, RecordingSink, ScriptedHttp, conditional, connector, eventually, flow, get, node,
        node_with_request,
    };

    fn workspace(ids: &[&str]) -> MemoryWorkspace {
        let mut ws = MemoryWorkspace::default();
        for id in ids {
            ws.add_request(get(id, &format!("https://x/{id}")));
        }
        ws
    }

    fn executor(http: &Arc<ScriptedHttp>, ws: MemoryWorkspace) -> FlowExecutor {
        let ws = Arc::new(ws);
        FlowExecutor::new(http.clone(), ws.clone(), ws)
    }

    fn status_of(run: &FlowRunResult, id: &str) -> NodeStatus {
        run.node(id).unwrap().status
    }

    #[tokio::test]
    async fn test_cycle_fails_without_dispatch() {
        let http = Arc::new(ScriptedHttp::new());
        let exec = executor(&http, workspace(&["a", "b"]));
        let f = flow(
            vec![node("a"), node("b")],
            vec![connector("c1", "a", "b"), connector("c2", "b", "a")],
        );
        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("flow contains a cycle"));
        assert!(http.calls().is_empty());
        assert!(run.node_results.values().all(|r| r.status == NodeStatus::Idle));
    }

    #[tokio::test]
    async fn test_invalid_flow_fails_without_dispatch() {
        let http = Arc::new(ScriptedHttp::new());
        let exec = executor(&http, workspace(&["a"]));
        let f = flow(vec![node("a")], vec![connector("c1", "a", "ghost")]);
        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().starts_with("invalid flow: connector c1"));
        assert!(http.calls().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_response_feeds_downstream_request() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/token", 200, r#"{"token":"abc"}"#);
        http.respond("https://x/api?token=abc", 200, "{}");
        let mut ws = MemoryWorkspace::default();
        ws.add_request(get("fetchToken", "https://x/token"));
        ws.add_request(get("useToken", "https://x/api?token={{auth.body.token}}"));
        let exec = executor(&http, ws);
        let f = flow(
            vec![
                node_with_request("n1", "fetchToken", "auth"),
                node_with_request("n2", "useToken", "api"),
            ],
            vec![connector("c1", "n1", "n2")],
        );

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(http.called_urls(), vec!["https://x/token", "https://x/api?token=abc"]);
        assert!(run.active_connector_ids.contains("c1"));
        assert_eq!(run.progress.succeeded, 2);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_independent_nodes_run_concurrently() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        http.respond("https://x/b", 200, "{}");
        http.gate("https://x/a");
        http.gate("https://x/b");
        let exec = executor(&http, workspace(&["a", "b"]));
        let f = flow(vec![node("a"), node("b")], vec![]);

        let (run, ()) = tokio::join!(exec.run_flow(&f, RunOptions::default()), async {
            http.wait_started("https://x/a").await;
            http.wait_started("https://x/b").await;
            assert_eq!(http.in_flight(), 2);
            assert_eq!(exec.current_run().unwrap().running_node_ids().len(), 2);
            http.open("https://x/a");
            http.open("https://x/b");
        });

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(http.max_in_flight(), 2);
    }

    #[tokio::test]
    async fn test_sequential_mode_keeps_one_in_flight() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        http.respond("https://x/b", 200, "{}");
        http.gate("https://x/a");
        let exec = executor(&http, workspace(&["a", "b"]));
        let f = flow(vec![node("a"), node("b")], vec![]);
        let options = RunOptions {
            parallel: false,
            ..RunOptions::default()
        };

        let (run, ()) = tokio::join!(exec.run_flow(&f, options), async {
            http.wait_started("https://x/a").await;
            eventually(|| exec.node_result("b").map(|r| r.status) == Some(NodeStatus::Pending)).await;
            assert_eq!(http.in_flight(), 1);
            http.open("https://x/a");
        });

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(http.max_in_flight(), 1);
        assert_eq!(http.called_urls(), vec!["https://x/a", "https://x/b"]);
    }

    #[tokio::test]
    async fn test_unmet_condition_skips_target() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        let exec = executor(&http, workspace(&["a", "b"]));
        let f = flow(
            vec![node("a"), node("b")],
            vec![conditional("c1", "a", "b", Condition::StatusEquals { status: 404 })],
        );

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(status_of(&run, "b"), NodeStatus::Skipped);
        assert!(run.skipped_connector_ids.contains("c1"));
        assert!(run.active_connector_ids.is_empty());
        assert_eq!(http.called_urls(), vec!["https://x/a"]);
    }

    #[tokio::test]
    async fn test_skip_cascades_without_failure() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        let exec = executor(&http, workspace(&["a", "b", "c"]));
        let f = flow(
            vec![node("a"), node("b"), node("c")],
            vec![
                conditional("c1", "a", "b", Condition::StatusEquals { status: 404 }),
                connector("c2", "b", "c"),
            ],
        );

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(status_of(&run, "b"), NodeStatus::Skipped);
        assert_eq!(status_of(&run, "c"), NodeStatus::Skipped);
        assert_eq!(run.progress.skipped, 2);
        assert_eq!(run.progress.failed, 0);
        assert!(run.skipped_connector_ids.contains("c1"));
        assert!(run.skipped_connector_ids.contains("c2"));
    }

    #[tokio::test]
    async fn test_skipped_source_connectors_are_recorded() {
        let http = Arc::new(ScriptedHttp::new());
        for id in ["a", "c", "d"] {
            http.respond(&format!("https://x/{id}"), 200, "{}");
        }
        let exec = executor(&http, workspace(&["a", "b", "c", "d"]));
        let f = flow(
            vec![node("a"), node("b"), node("c"), node("d")],
            vec![
                conditional("ab", "a", "b", Condition::StatusEquals { status: 404 }),
                connector("bd", "b", "d"),
                connector("cd", "c", "d"),
            ],
        );

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(status_of(&run, "b"), NodeStatus::Skipped);
        assert_eq!(status_of(&run, "d"), NodeStatus::Success);
        assert!(run.skipped_connector_ids.contains("ab"));
        assert!(run.skipped_connector_ids.contains("bd"));
        assert!(!run.active_connector_ids.contains("bd"));
        assert!(run.active_connector_ids.contains("cd"));
    }

    #[tokio::test]
    async fn test_any_active_connector_is_enough() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        http.respond("https://x/b", 200, "{}");
        http.respond("https://x/c", 200, "{}");
        let exec = executor(&http, workspace(&["a", "b", "c"]));
        let f = flow(
            vec![node("a"), node("b"), node("c")],
            vec![
                conditional("c1", "a", "c", Condition::StatusEquals { status: 500 }),
                connector("c2", "b", "c"),
            ],
        );

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(status_of(&run, "c"), NodeStatus::Success);
        assert!(run.skipped_connector_ids.contains("c1"));
        assert!(run.active_connector_ids.contains("c2"));
    }

    #[tokio::test]
    async fn test_failure_drains_in_flight_and_stops_dispatch() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 500, r#"{"error":"boom"}"#);
        http.respond("https://x/b", 200, "{}");
        http.gate("https://x/b");
        let exec = executor(&http, workspace(&["a", "b", "c"]));
        let f = flow(
            vec![node("a"), node("b"), node("c")],
            vec![connector("c1", "b", "c")],
        );

        let (run, ()) = tokio::join!(exec.run_flow(&f, RunOptions::default()), async {
            http.wait_started("https://x/b").await;
            eventually(|| exec.node_result("a").map(|r| r.status) == Some(NodeStatus::Failed)).await;
            http.open("https://x/b");
        });

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("1 node(s) failed"));
        assert_eq!(status_of(&run, "b"), NodeStatus::Success);
        assert!(run.node("b").unwrap().response.is_some());
        assert_eq!(status_of(&run, "c"), NodeStatus::Idle);
        assert!(!http.called_urls().contains(&"https://x/c".to_string()));

        let a = run.node("a").unwrap();
        assert!(a.error.as_deref().unwrap().starts_with("HTTP 500"));
        assert_eq!(a.response.as_ref().unwrap().status, 500);
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_finish() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        http.gate("https://x/a");
        let exec = executor(&http, workspace(&["a", "b"]));
        let f = flow(vec![node("a"), node("b")], vec![connector("c1", "a", "b")]);

        let (run, ()) = tokio::join!(exec.run_flow(&f, RunOptions::default()), async {
            http.wait_started("https://x/a").await;
            exec.cancel_flow();
            http.open("https://x/a");
        });

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(status_of(&run, "a"), NodeStatus::Success);
        assert!(run.node("a").unwrap().response.is_some());
        assert_eq!(status_of(&run, "b"), NodeStatus::Idle);
        assert_eq!(http.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_never_starts_idle_independent_node() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        http.respond("https://x/b", 200, "{}");
        http.gate("https://x/a");
        let sink = Arc::new(RecordingSink::default());
        let exec = executor(&http, workspace(&["a", "b"])).with_sink(sink.clone());
        let f = flow(vec![node("a"), node("b")], vec![]);
        let options = RunOptions {
            parallel: false,
            ..RunOptions::default()
        };

        let (run, ()) = tokio::join!(exec.run_flow(&f, options), async {
            http.wait_started("https://x/a").await;
            assert_ne!(exec.node_result("b").map(|r| r.status), Some(NodeStatus::Running));
            exec.cancel_flow();
            http.open("https://x/a");
        });

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(status_of(&run, "a"), NodeStatus::Success);
        assert!(run.node("a").unwrap().response.is_some());
        assert_eq!(status_of(&run, "b"), NodeStatus::Idle);
        assert!(run.node("b").unwrap().started_at.is_none());
        assert_eq!(http.called_urls(), vec!["https://x/a"]);
        assert!(
            sink.states()
                .iter()
                .all(|s| s.result.node("b").unwrap().status != NodeStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_unknown_request_fails_without_network() {
        let http = Arc::new(ScriptedHttp::new());
        let exec = executor(&http, workspace(&[]));
        let f = flow(vec![node_with_request("n", "missing", "n")], vec![]);

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.node("n").unwrap().error.as_deref(), Some("request not found: missing"));
        assert!(http.calls().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_fails_node() {
        let http = Arc::new(ScriptedHttp::new());
        http.fail("https://x/a", "connection refused");
        let exec = executor(&http, workspace(&["a"]));
        let f = flow(vec![node("a")], vec![]);

        let run = exec.run_flow(&f, RunOptions::default()).await;
        let a = run.node("a").unwrap();
        assert_eq!(a.status, NodeStatus::Failed);
        assert_eq!(a.error.as_deref(), Some("request failed: connection refused"));
        assert!(a.response.is_none());
    }

    #[tokio::test]
    async fn test_progress_published_after_each_completion() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        http.respond("https://x/b", 200, "{}");
        let sink = Arc::new(RecordingSink::default());
        let (tx, mut rx) = broadcast::channel(64);
        let exec = executor(&http, workspace(&["a", "b"]))
            .with_sink(sink.clone())
            .with_events(tx);
        let f = flow(vec![node("a"), node("b")], vec![connector("c1", "a", "b")]);

        let run = exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(run.status, RunStatus::Success);

        let states = sink.states();
        let first = states.first().unwrap();
        assert!(first.is_running);
        assert_eq!(first.result.progress.completed, 0);
        let completed: Vec<usize> = states.iter().map(|s| s.result.progress.completed).collect();
        assert!(completed.contains(&1));
        let last = states.last().unwrap();
        assert!(!last.is_running);
        assert_eq!(last.result.progress.completed, 2);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.event_type);
        }
        assert_eq!(events.first(), Some(&RunEventType::RunStarted));
        assert_eq!(events.last(), Some(&RunEventType::RunCompleted));
        assert_eq!(events.iter().filter(|e| **e == RunEventType::NodeStarted).count(), 2);
        assert_eq!(events.iter().filter(|e| **e == RunEventType::NodeCompleted).count(), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_run_state() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://x/a", 200, "{}");
        let states = Arc::new(InMemoryRunStates::new());
        let exec = executor(&http, workspace(&["a"])).with_sink(states.clone());
        let f = flow(vec![node("a")], vec![]);

        exec.run_flow(&f, RunOptions::default()).await;
        assert_eq!(exec.node_result("a").unwrap().status, NodeStatus::Success);
        assert!(!states.get("flow-1").unwrap().is_running);

        exec.reset_flow();
        assert!(exec.node_result("a").is_none());
        assert!(states.get("flow-1").is_none());
    }

    #[tokio::test]
    async fn test_environment_override_wins_over_flow_default() {
        let http = Arc::new(ScriptedHttp::new());
        http.respond("https://dev.x/ping", 200, "{}");
        http.respond("https://prod.x/ping", 200, "{}");
        let mut ws = MemoryWorkspace::default();
        ws.add_request(get("ping", "https://{{host}}/ping"));
        for (id, host) in [("dev", "dev.x"), ("prod", "prod.x")] {
            ws.environments.push(Environment {
                id: id.into(),
                name: id.into(),
                variables: vec![Variable { key: "host".into(), value: host.into(), enabled: true }],
            });
        }
        let exec = executor(&http, ws);
        let mut f = flow(vec![node_with_request("n", "ping", "ping")], vec![]);
        f.default_env_id = Some("dev".into());

        exec.run_flow(&f, RunOptions::default()).await;
        let options = RunOptions {
            environment_id: Some("prod".into()),
            ..RunOptions::default()
        };
        exec.run_flow(&f, options).await;
        assert_eq!(http.called_urls(), vec!["https://dev.x/ping", "https://prod.x/ping"]);
    }
}
