//! Module expansion pre-pass
//!
//! Every `ModuleBoundary` node is replaced by the nodes its expander returns,
//! keyed `<module key>.<local key>`. Afterwards [`link`] rewrites references to
//! module outputs, `depends_on` entries naming a module, and builder edges
//! touching a module, so the rest of the builder only ever sees plain nodes.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::context::CollaboratorRegistry;
use crate::error::{Error, Result};
use crate::graph::{MAX_MODULE_DEPTH, dynamic};
use crate::reference;
use crate::resource::{Node, NodeKey, NodeKind};

/// What the graph keeps of an expanded module
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    /// Output name to expression, already rewritten to prefixed keys
    pub outputs: BTreeMap<String, String>,
    /// Dependencies of the module node itself
    pub depends_on: BTreeSet<NodeKey>,
    /// Reference paths found in the module node's own configuration
    pub references: Vec<String>,
}

/// Result of the pre-pass
#[derive(Debug, Default)]
pub struct Expanded {
    pub nodes: Vec<Node>,
    pub edges: Vec<(NodeKey, NodeKey)>,
    pub modules: BTreeMap<NodeKey, ModuleInfo>,
}

/// Expand module boundaries (recursively) and dynamic blocks
pub fn expand(
    nodes: Vec<Node>,
    edges: Vec<(NodeKey, NodeKey)>,
    registry: Option<&CollaboratorRegistry>,
) -> Result<Expanded> {
    let mut expanded = Expanded {
        edges,
        ..Expanded::default()
    };
    let mut worklist: VecDeque<(Node, usize)> = nodes.into_iter().map(|n| (n, 0)).collect();

    while let Some((mut node, depth)) = worklist.pop_front() {
        node.config = dynamic::expand(&node.key, &node.config)?;

        if node.kind != NodeKind::ModuleBoundary {
            expanded.nodes.push(node);
            continue;
        }

        let fail = |message: String| Error::ModuleExpansion {
            module: node.key.clone(),
            message,
        };

        if depth >= MAX_MODULE_DEPTH {
            return Err(fail(format!("modules nested deeper than {MAX_MODULE_DEPTH} levels")));
        }

        let expander = registry
            .and_then(|r| r.expander(&node.resource_type))
            .ok_or_else(|| fail(format!("no expander registered for module type '{}'", node.resource_type)))?;
        let expansion = expander
            .expand(&node.config)
            .map_err(|e| fail(e.to_string()))?;

        log::debug!(
            "Expanded module {} into {} nodes",
            node.key,
            expansion.nodes.len()
        );

        let mut local: BTreeSet<String> = BTreeSet::new();
        for sub in &expansion.nodes {
            if !local.insert(sub.key.as_str().to_string()) {
                return Err(Error::DuplicateNode(node.key.child(sub.key.as_str())));
            }
        }

        let prefix = |key: &NodeKey| -> NodeKey {
            if local.contains(key.as_str()) {
                node.key.child(key.as_str())
            } else {
                key.clone()
            }
        };
        let mut localize = |path: &str| -> std::result::Result<Option<Value>, Error> {
            Ok(reference::split(path, |k| local.contains(k)).map(|(key, attrs)| {
                let mut rewritten = node.key.child(key).as_str().to_string();
                for attr in attrs {
                    rewritten.push('.');
                    rewritten.push_str(attr);
                }
                reference::token(&rewritten)
            }))
        };

        for (before, after) in &expansion.edges {
            for endpoint in [before, after] {
                if !local.contains(endpoint.as_str()) {
                    return Err(fail(format!("edge endpoint {endpoint} is not a node of the module")));
                }
            }
            expanded.edges.push((prefix(before), prefix(after)));
        }

        let mut outputs = BTreeMap::new();
        for (name, expression) in &expansion.outputs {
            let rewritten = match reference::transform(&Value::String(expression.clone()), &mut localize)? {
                Value::String(s) => s,
                other => other.to_string(),
            };
            outputs.insert(name.clone(), rewritten);
        }

        for mut sub in expansion.nodes {
            sub.config = reference::transform_config(&sub.config, &mut localize)?;
            sub.depends_on = sub.depends_on.iter().map(prefix).collect();
            sub.depends_on.extend(node.depends_on.iter().cloned());
            sub.key = node.key.child(sub.key.as_str());
            worklist.push_back((sub, depth + 1));
        }

        expanded.modules.insert(
            node.key.clone(),
            ModuleInfo {
                outputs,
                depends_on: node.depends_on.clone(),
                references: reference::collect(&node.config),
            },
        );
    }

    Ok(expanded)
}

/// Rewrite module references now that every key is known
///
/// - `${<module>.<output>...}` becomes the output's expression
/// - `depends_on` and builder edges naming a module fan out to its members
/// - members inherit dependencies referenced from the module node's config
pub fn link(expanded: &mut Expanded) -> Result<()> {
    if expanded.modules.is_empty() {
        return Ok(());
    }

    let keys: BTreeSet<NodeKey> = expanded.nodes.iter().map(|n| n.key.clone()).collect();
    let modules = &expanded.modules;

    let members = |module: &NodeKey| -> Vec<NodeKey> {
        keys.iter().filter(|k| k.is_within(module)).cloned().collect()
    };
    let fan_out = |key: &NodeKey| -> Vec<NodeKey> {
        if modules.contains_key(key) {
            members(key)
        } else {
            vec![key.clone()]
        }
    };

    // Targets inherited by each member from its enclosing modules
    let mut inherited: BTreeMap<NodeKey, BTreeSet<NodeKey>> = BTreeMap::new();
    for (module, info) in modules {
        let mut targets = BTreeSet::new();
        for path in &info.references {
            let resolved = resolve_outputs(module, &reference::token(path), &keys, modules)?;
            let mut paths = Vec::new();
            reference::collect_value(&resolved, &mut paths);
            for path in paths {
                // Unknown paths are module-internal references consumed by the expander
                if let Some((target, _)) = reference::split(&path, |k| keys.contains(k)) {
                    let target = NodeKey::from(target);
                    if !target.is_within(module) {
                        targets.insert(target);
                    }
                }
            }
        }
        for dep in &info.depends_on {
            targets.extend(fan_out(dep));
        }
        for member in members(module) {
            inherited.entry(member).or_default().extend(targets.iter().cloned());
        }
    }

    for node in &mut expanded.nodes {
        for value in node.config.values_mut() {
            *value = resolve_outputs(&node.key, value, &keys, modules)?;
        }

        let mut depends_on: BTreeSet<NodeKey> = node.depends_on.iter().flat_map(&fan_out).collect();
        if let Some(targets) = inherited.remove(&node.key) {
            depends_on.extend(targets);
        }
        node.depends_on = depends_on;
    }

    expanded.edges = expanded
        .edges
        .iter()
        .flat_map(|(before, after)| {
            let afters = fan_out(after);
            fan_out(before)
                .into_iter()
                .flat_map(move |b| afters.clone().into_iter().map(move |a| (b.clone(), a)))
        })
        .collect();

    Ok(())
}

/// Replace module output references until none remain
fn resolve_outputs(
    node: &NodeKey,
    value: &Value,
    keys: &BTreeSet<NodeKey>,
    modules: &BTreeMap<NodeKey, ModuleInfo>,
) -> Result<Value> {
    let mut current = value.clone();

    for _ in 0..=MAX_MODULE_DEPTH {
        let mut changed = false;
        current = reference::transform(&current, &mut |path: &str| {
            let Some((target, attrs)) =
                reference::split(path, |k| keys.contains(k) || modules.contains_key(k))
            else {
                return Ok(None);
            };
            let Some(module) = modules.get(target) else {
                return Ok(None);
            };

            let Some((output, rest)) = attrs.split_first() else {
                return Err(Error::InvalidConfig {
                    node: node.clone(),
                    message: format!("reference to module {target} must name one of its outputs"),
                });
            };
            let expression = module.outputs.get(*output).ok_or_else(|| Error::ConfigMismatch {
                node: node.clone(),
                reference: path.to_string(),
            })?;

            changed = true;
            if rest.is_empty() {
                return Ok(Some(Value::String(expression.clone())));
            }
            match reference::single(expression) {
                Some(inner) => Ok(Some(reference::token(&format!("{inner}.{}", rest.join("."))))),
                None => Err(Error::InvalidConfig {
                    node: node.clone(),
                    message: format!(
                        "output {output} of module {target} is not a single reference, cannot index into it"
                    ),
                }),
            }
        })?;

        if !changed {
            return Ok(current);
        }
    }

    Err(Error::ModuleExpansion {
        module: node.clone(),
        message: "module outputs reference each other in a loop".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ModuleExpander, ModuleExpansion};
    use crate::error::CollaboratorError;
    use crate::resource::Config;
    use serde_json::json;

    /// Expands to a cluster and a node group, exposing the cluster name
    struct EksModule;

    impl ModuleExpander for EksModule {
        fn expand(&self, config: &Config) -> std::result::Result<ModuleExpansion, CollaboratorError> {
            let name = config
                .get("cluster_name")
                .cloned()
                .ok_or_else(|| CollaboratorError::permanent("cluster_name is required"))?;
            Ok(ModuleExpansion {
                nodes: vec![
                    Node::managed("aws_eks_cluster.this", "aws_eks_cluster")
                        .with_config("name", name)
                        .with_config("subnets", config.get("subnets").cloned().unwrap_or(Value::Null)),
                    Node::managed("aws_eks_node_group.default", "aws_eks_node_group")
                        .with_config("cluster", json!("${aws_eks_cluster.this.name}")),
                ],
                edges: vec![],
                outputs: BTreeMap::from([
                    ("cluster_name".to_string(), "${aws_eks_cluster.this.name}".to_string()),
                    ("cluster".to_string(), "${aws_eks_cluster.this}".to_string()),
                ]),
            })
        }
    }

    /// Wraps another module, to test nesting
    struct Nested;

    impl ModuleExpander for Nested {
        fn expand(&self, _config: &Config) -> std::result::Result<ModuleExpansion, CollaboratorError> {
            Ok(ModuleExpansion {
                nodes: vec![Node::module("module.inner", "nested")],
                ..ModuleExpansion::default()
            })
        }
    }

    fn registry() -> CollaboratorRegistry {
        CollaboratorRegistry::new()
            .with_expander("eks", EksModule)
            .with_expander("nested", Nested)
    }

    #[test]
    fn test_expand_prefixes_keys_and_local_references() {
        let module = Node::module("module.eks", "eks")
            .with_config("cluster_name", json!("demo"))
            .with_config("subnets", json!("${aws_subnet.private.ids}"))
            .depends_on("aws_vpc.main");
        let registry = registry();
        let expanded = expand(vec![module], vec![], Some(&registry)).unwrap();

        let keys: Vec<&str> = expanded.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["module.eks.aws_eks_cluster.this", "module.eks.aws_eks_node_group.default"]
        );

        let group = &expanded.nodes[1];
        assert_eq!(group.config["cluster"], json!("${module.eks.aws_eks_cluster.this.name}"));
        assert!(group.depends_on.contains("aws_vpc.main"));

        let info = &expanded.modules[&NodeKey::from("module.eks")];
        assert_eq!(info.outputs["cluster_name"], "${module.eks.aws_eks_cluster.this.name}");
        assert_eq!(info.references, vec!["aws_subnet.private.ids".to_string()]);
    }

    #[test]
    fn test_link_rewrites_outputs_and_inherits_dependencies() {
        let nodes = vec![
            Node::managed("aws_subnet.private", "aws_subnet"),
            Node::module("module.eks", "eks")
                .with_config("cluster_name", json!("demo"))
                .with_config("subnets", json!("${aws_subnet.private.ids}")),
            Node::managed("helm_release.lb", "helm_release")
                .with_config("cluster", json!("name=${module.eks.cluster_name}"))
                .with_config("endpoint", json!("${module.eks.cluster.endpoint}")),
            Node::action("action.patch").depends_on("module.eks"),
        ];
        let registry = registry();
        let mut expanded = expand(nodes, vec![], Some(&registry)).unwrap();
        link(&mut expanded).unwrap();

        let find = |key: &str| expanded.nodes.iter().find(|n| n.key.as_str() == key).unwrap();

        let lb = find("helm_release.lb");
        assert_eq!(lb.config["cluster"], json!("name=${module.eks.aws_eks_cluster.this.name}"));
        assert_eq!(lb.config["endpoint"], json!("${module.eks.aws_eks_cluster.this.endpoint}"));

        let patch = find("action.patch");
        assert!(patch.depends_on.contains("module.eks.aws_eks_cluster.this"));
        assert!(patch.depends_on.contains("module.eks.aws_eks_node_group.default"));
        assert!(!patch.depends_on.contains("module.eks"));

        let group = find("module.eks.aws_eks_node_group.default");
        assert!(group.depends_on.contains("aws_subnet.private"));
    }

    #[test]
    fn test_unknown_output_is_config_mismatch() {
        let nodes = vec![
            Node::module("module.eks", "eks").with_config("cluster_name", json!("demo")),
            Node::managed("helm_release.lb", "helm_release")
                .with_config("cluster", json!("${module.eks.no_such_output}")),
        ];
        let registry = registry();
        let mut expanded = expand(nodes, vec![], Some(&registry)).unwrap();
        let err = link(&mut expanded).unwrap_err();
        assert!(matches!(err, Error::ConfigMismatch { .. }));
    }

    #[test]
    fn test_missing_expander() {
        let err = expand(vec![Node::module("module.x", "unknown")], vec![], None).unwrap_err();
        assert!(matches!(err, Error::ModuleExpansion { .. }));
    }

    #[test]
    fn test_nesting_limit() {
        let registry = registry();
        let err = expand(vec![Node::module("module.outer", "nested")], vec![], Some(&registry)).unwrap_err();
        match err {
            Error::ModuleExpansion { message, .. } => assert!(message.contains("nested deeper")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_expander_error_is_reported() {
        let registry = registry();
        let err = expand(vec![Node::module("module.eks", "eks")], vec![], Some(&registry)).unwrap_err();
        match err {
            Error::ModuleExpansion { module, message } => {
                assert_eq!(module.as_str(), "module.eks");
                assert!(message.contains("cluster_name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
