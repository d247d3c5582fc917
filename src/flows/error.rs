/// Structural problems that stop a flow before any node runs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("flow has no nodes")]
    Empty,

    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("node {0} has an empty alias")]
    EmptyAlias(String),

    #[error("alias '{alias}' on node {node} must not contain '.'")]
    DottedAlias { node: String, alias: String },

    #[error("duplicate alias '{alias}' on nodes {first} and {second}")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("duplicate connector id: {0}")]
    DuplicateConnectorId(String),

    #[error("connector {connector} references unknown source node {node}")]
    DanglingSource { connector: String, node: String },

    #[error("connector {connector} references unknown target node {node}")]
    DanglingTarget { connector: String, node: String },

    #[error("flow contains a cycle")]
    Cycle,
}

/// Why a single node failed. Rendered into `FlowNodeResult.error`.
#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("unresolved variables: {}", .0.join(", "))]
    Unresolved(Vec<String>),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("HTTP {status} {status_text}")]
    Status { status: u16, status_text: String },
}
