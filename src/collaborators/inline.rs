use converge::{CollaboratorError, Config, ModuleExpander, ModuleExpansion, NodeKey};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::document::NodeDocument;

/// Module whose members are written out in its own configuration
///
/// ```json
/// { "key": "module.eks", "kind": "module", "type": "inline", "config": {
///     "nodes": [{ "key": "cluster", "type": "aws_eks_cluster" }],
///     "outputs": { "cluster_name": "${cluster.name}" } } }
/// ```
pub struct InlineModule;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct InlineConfig {
    nodes: Vec<NodeDocument>,
    #[serde(default)]
    edges: Vec<(String, String)>,
    #[serde(default)]
    outputs: BTreeMap<String, String>,
}

impl ModuleExpander for InlineModule {
    fn expand(&self, config: &Config) -> Result<ModuleExpansion, CollaboratorError> {
        let value = Value::Object(config.clone().into_iter().collect());
        let inline: InlineConfig = serde_json::from_value(value)
            .map_err(|e| CollaboratorError::permanent(format!("invalid inline module: {e}")))?;

        let nodes = inline
            .nodes
            .into_iter()
            .map(NodeDocument::into_node)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ModuleExpansion {
            nodes,
            edges: inline
                .edges
                .into_iter()
                .map(|(a, b)| (NodeKey::from(a), NodeKey::from(b)))
                .collect(),
            outputs: inline.outputs,
        })
    }
}
