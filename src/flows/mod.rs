pub mod condition;
pub mod context;
pub mod error;
pub mod events;
pub mod graph;
pub mod history;
pub mod materializer;
pub mod resolver;
pub mod runner;
pub mod sink;

#[cfg(test)]
pub(crate) mod test_support;

use serde::{Deserialize, Serialize};

pub use condition::Condition;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub connectors: Vec<FlowConnector>,
    #[serde(default)]
    pub default_env_id: Option<String>,
    #[serde(default)]
    pub default_auth_id: Option<String>,
}

impl Flow {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    /// Request template id, optionally qualified as `"<collectionFile>:<itemId>"`.
    pub request_id: String,
    /// Name other nodes use to reference this node's response.
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConnector {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}
