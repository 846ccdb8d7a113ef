//! Graph documents: the JSON form of an already-parsed declaration set
//!
//! ```json
//! {
//!   "nodes": [
//!     { "key": "vpc", "type": "aws_vpc", "config": { "cidr": "10.0.0.0/16" } },
//!     { "key": "lb_barrier", "kind": "barrier", "config": { "destroy_duration": "90s" },
//!       "depends_on": ["lb_controller"] }
//!   ],
//!   "edges": [["vpc", "cluster"]]
//! }
//! ```

use anyhow::{Context, Result};
use converge::{CollaboratorRegistry, Config, Dag, GraphBuilder, Node, NodeKey, NodeKind, Timeouts};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Node kind as spelled in documents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindName {
    #[default]
    #[serde(alias = "managed_resource")]
    Resource,
    #[serde(alias = "module_boundary")]
    Module,
    #[serde(alias = "imperative_action")]
    Action,
    #[serde(alias = "timed_barrier")]
    Barrier,
}

impl From<KindName> for NodeKind {
    fn from(kind: KindName) -> Self {
        match kind {
            KindName::Resource => NodeKind::ManagedResource,
            KindName::Module => NodeKind::ModuleBoundary,
            KindName::Action => NodeKind::ImperativeAction,
            KindName::Barrier => NodeKind::TimedBarrier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDocument {
    pub key: String,
    #[serde(default)]
    pub kind: KindName,
    /// Required for resources and modules
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl NodeDocument {
    pub fn into_node(self) -> Result<Node> {
        let kind = NodeKind::from(self.kind);
        let resource_type = match (self.resource_type, self.kind) {
            (Some(t), _) => t,
            (None, KindName::Action) => "action".to_string(),
            (None, KindName::Barrier) => "time_sleep".to_string(),
            (None, _) => anyhow::bail!("node '{}' has no \"type\"", self.key),
        };

        let mut node = Node::new(self.key, kind, resource_type).with_timeouts(self.timeouts);
        node.config = self.config;
        node.depends_on = self.depends_on.into_iter().map(NodeKey::from).collect();
        Ok(node)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDocument {
    pub nodes: Vec<NodeDocument>,
    /// Extra `[before, after]` edges
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

impl GraphDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid graph document {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn into_parts(self) -> Result<(Vec<Node>, Vec<(NodeKey, NodeKey)>)> {
        let nodes = self
            .nodes
            .into_iter()
            .map(NodeDocument::into_node)
            .collect::<Result<Vec<_>>>()?;
        let edges = self
            .edges
            .into_iter()
            .map(|(a, b)| (NodeKey::from(a), NodeKey::from(b)))
            .collect();
        Ok((nodes, edges))
    }

    /// Build the DAG, expanding modules through `registry`
    pub fn build(self, registry: &CollaboratorRegistry) -> Result<Dag> {
        let (nodes, edges) = self.into_parts()?;
        let builder = edges
            .into_iter()
            .fold(GraphBuilder::new().nodes(nodes), |b, (before, after)| b.edge(before, after));
        Ok(builder.with_modules(registry).build()?)
    }
}

/// Load and build a graph document in one step
pub fn load_dag(path: &Path, registry: &CollaboratorRegistry) -> Result<Dag> {
    let document = GraphDocument::load(path)?;
    document
        .build(registry)
        .with_context(|| format!("Could not build graph from {}", path.display()))
}
