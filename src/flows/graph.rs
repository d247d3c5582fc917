//! Structural analysis of a flow: validation, topological order, and
//! connector / upstream lookups backed by a precomputed adjacency index.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::error::ValidationError;
use super::{Flow, FlowConnector, FlowNode};

pub struct FlowGraph<'a> {
    flow: &'a Flow,
    position: HashMap<&'a str, usize>,
    incoming: HashMap<&'a str, Vec<&'a FlowConnector>>,
    outgoing: HashMap<&'a str, Vec<&'a FlowConnector>>,
}

impl<'a> FlowGraph<'a> {
    /// Index the flow. Connectors that reference unknown nodes are left out
    /// of the index; `validate_flow` reports them.
    pub fn new(flow: &'a Flow) -> Self {
        let mut position = HashMap::new();
        for (i, node) in flow.nodes.iter().enumerate() {
            position.entry(node.id.as_str()).or_insert(i);
        }

        let mut incoming: HashMap<&str, Vec<&FlowConnector>> = HashMap::new();
        let mut outgoing: HashMap<&str, Vec<&FlowConnector>> = HashMap::new();
        for connector in &flow.connectors {
            let source = connector.source_node_id.as_str();
            let target = connector.target_node_id.as_str();
            if !position.contains_key(source) || !position.contains_key(target) {
                continue;
            }
            outgoing.entry(source).or_default().push(connector);
            incoming.entry(target).or_default().push(connector);
        }

        Self {
            flow,
            position,
            incoming,
            outgoing,
        }
    }

    pub fn flow(&self) -> &'a Flow {
        self.flow
    }

    pub fn incoming(&self, node_id: &str) -> &[&'a FlowConnector] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn outgoing(&self, node_id: &str) -> &[&'a FlowConnector] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Kahn's algorithm; equally-ready nodes come out in declaration order.
    /// Returns `None` when the connectors form a cycle.
    pub fn topological_order(&self) -> Option<Vec<&'a FlowNode>> {
        let nodes = &self.flow.nodes;
        let mut in_degree: Vec<usize> = vec![0; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            if self.position.get(node.id.as_str()) == Some(&i) {
                in_degree[i] = self.incoming(&node.id).len();
            }
        }

        let mut ready: BTreeSet<usize> = (0..nodes.len())
            .filter(|i| in_degree[*i] == 0 && self.position.get(nodes[*i].id.as_str()) == Some(i))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(i) = ready.pop_first() {
            let node = &nodes[i];
            order.push(node);
            for connector in self.outgoing(&node.id) {
                let target = self.position[connector.target_node_id.as_str()];
                in_degree[target] -= 1;
                if in_degree[target] == 0 {
                    ready.insert(target);
                }
            }
        }

        if order.len() != self.position.len() {
            return None;
        }
        Some(order)
    }

    /// Every node `node_id` transitively depends on (excluding itself).
    pub fn upstream_node_ids(&self, node_id: &str) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
        while let Some(current) = queue.pop_front() {
            for connector in self.incoming(current) {
                let source = connector.source_node_id.as_str();
                if source != node_id && seen.insert(source.to_string()) {
                    queue.push_back(source);
                }
            }
        }
        seen
    }

    /// Aliases of every node upstream of `node_id`.
    pub fn upstream_aliases(&self, node_id: &str) -> HashSet<String> {
        self.upstream_node_ids(node_id)
            .iter()
            .filter_map(|id| self.flow.node(id))
            .map(|n| n.alias.clone())
            .collect()
    }
}

pub fn topological_order(flow: &Flow) -> Option<Vec<&FlowNode>> {
    FlowGraph::new(flow).topological_order()
}

/// Structural checks. Empty means valid (cycles are reported separately by
/// `topological_order`).
pub fn validation_errors(flow: &Flow) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if flow.nodes.is_empty() {
        errors.push(ValidationError::Empty);
    }

    let mut node_ids: HashSet<&str> = HashSet::new();
    let mut aliases: HashMap<&str, &str> = HashMap::new();
    for node in &flow.nodes {
        if !node_ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
        let alias = node.alias.trim();
        if alias.is_empty() {
            errors.push(ValidationError::EmptyAlias(node.id.clone()));
            continue;
        }
        // `{{alias.path}}` splits on the first dot.
        if alias.contains('.') {
            errors.push(ValidationError::DottedAlias {
                node: node.id.clone(),
                alias: alias.to_string(),
            });
        }
        if let Some(first) = aliases.insert(alias, node.id.as_str()) {
            errors.push(ValidationError::DuplicateAlias {
                alias: alias.to_string(),
                first: first.to_string(),
                second: node.id.clone(),
            });
        }
    }

    let mut connector_ids: HashSet<&str> = HashSet::new();
    for connector in &flow.connectors {
        if !connector_ids.insert(connector.id.as_str()) {
            errors.push(ValidationError::DuplicateConnectorId(connector.id.clone()));
        }
        if !node_ids.contains(connector.source_node_id.as_str()) {
            errors.push(ValidationError::DanglingSource {
                connector: connector.id.clone(),
                node: connector.source_node_id.clone(),
            });
        }
        if !node_ids.contains(connector.target_node_id.as_str()) {
            errors.push(ValidationError::DanglingTarget {
                connector: connector.id.clone(),
                node: connector.target_node_id.clone(),
            });
        }
    }
    errors
}

pub fn validate_flow(flow: &Flow) -> Vec<String> {
    validation_errors(flow).iter().map(ToString::to_string).collect()
}
