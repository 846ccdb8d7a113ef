//! Graph Builder: declarations in, immutable [`Dag`] out
//!
//! Building runs in fixed stages:
//!
//! 1. module expansion pre-pass (plus dynamic blocks), see [`module`]
//! 2. barrier validation
//! 3. reference scanning for inferred edges (parallel)
//! 4. explicit edges from `depends_on` and [`GraphBuilder::edge`]
//! 5. cycle detection
//!
//! Any failure is fatal; nothing is auto-repaired.

mod cycle;
pub mod dynamic;
mod module;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::context::CollaboratorRegistry;
use crate::error::{Error, Result};
use crate::reference;
use crate::resource::{Node, NodeKey, NodeKind};

pub use cycle::find_cycle;

/// Maximum nesting of module boundaries
pub const MAX_MODULE_DEPTH: usize = 16;

/// How an edge came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared by the author
    Explicit,
    /// Derived from a `${...}` reference
    Inferred,
}

/// Immutable dependency graph
///
/// Every node's `depends_on` holds its full predecessor set (explicit and
/// inferred). There is no mutating API; a new declaration pass builds a new
/// `Dag`.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: BTreeMap<NodeKey, Node>,
    edges: BTreeMap<(NodeKey, NodeKey), EdgeKind>,
    dependents: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
    /// Nodes whose outputs each node's configuration reads
    references: BTreeMap<NodeKey, BTreeSet<NodeKey>>,
}

impl Dag {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    /// Nodes in key order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// `(before, after, kind)` in key order
    pub fn edges(&self) -> impl Iterator<Item = (&NodeKey, &NodeKey, EdgeKind)> {
        self.edges.iter().map(|((a, b), kind)| (a, b, *kind))
    }

    /// Nodes referenced through `${...}` in the node's configuration
    pub fn references(&self, key: &str) -> impl Iterator<Item = &NodeKey> {
        self.references.get(key).into_iter().flatten()
    }

    /// Direct predecessors
    pub fn dependencies(&self, key: &str) -> impl Iterator<Item = &NodeKey> {
        self.nodes
            .get(key)
            .into_iter()
            .flat_map(|n| n.depends_on.iter())
    }

    /// Direct successors
    pub fn dependents(&self, key: &str) -> impl Iterator<Item = &NodeKey> {
        self.dependents.get(key).into_iter().flatten()
    }

    /// Every node reachable by following edges forward from `key`
    pub fn transitive_dependents(&self, key: &str) -> BTreeSet<NodeKey> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&NodeKey> = self.dependents(key).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next.as_str()));
            }
        }
        seen
    }

    /// Kahn's order, ascending key among ready nodes
    pub fn topological_order(&self) -> Vec<NodeKey> {
        let predecessors: BTreeMap<NodeKey, BTreeSet<NodeKey>> = self
            .nodes
            .values()
            .map(|n| (n.key.clone(), n.depends_on.clone()))
            .collect();
        // The builder rejected cycles, so the sort is total
        topological_sort(&predecessors).unwrap_or_default()
    }

    /// Graphviz rendering; inferred edges are dashed
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph terrace {\n  rankdir=LR;\n");
        for node in self.nodes.values() {
            let shape = match node.kind {
                NodeKind::ManagedResource => "box",
                NodeKind::ImperativeAction => "cds",
                NodeKind::TimedBarrier => "octagon",
                NodeKind::ModuleBoundary => "folder",
            };
            let _ = writeln!(out, "  \"{}\" [shape={shape}];", node.key);
        }
        for ((before, after), kind) in &self.edges {
            match kind {
                EdgeKind::Explicit => {
                    let _ = writeln!(out, "  \"{before}\" -> \"{after}\";");
                }
                EdgeKind::Inferred => {
                    let _ = writeln!(out, "  \"{before}\" -> \"{after}\" [style=dashed];");
                }
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Kahn's algorithm over a predecessor map with ascending-key tie-break
///
/// Predecessors missing from the map are ignored. On a cycle, returns the
/// keys that could not be ordered.
pub fn topological_sort(
    predecessors: &BTreeMap<NodeKey, BTreeSet<NodeKey>>,
) -> std::result::Result<Vec<NodeKey>, Vec<NodeKey>> {
    let mut remaining: BTreeMap<&NodeKey, usize> = BTreeMap::new();
    let mut successors: BTreeMap<&NodeKey, Vec<&NodeKey>> = BTreeMap::new();

    for (key, preds) in predecessors {
        let known: Vec<&NodeKey> = preds.iter().filter(|p| predecessors.contains_key(*p)).collect();
        remaining.insert(key, known.len());
        for pred in known {
            successors.entry(pred).or_default().push(key);
        }
    }

    let mut ready: BTreeSet<&NodeKey> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(key, _)| *key)
        .collect();
    let mut order = Vec::with_capacity(predecessors.len());

    while let Some(key) = ready.pop_first() {
        order.push(key.clone());
        for succ in successors.get(key).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(succ) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(succ);
                }
            }
        }
    }

    if order.len() == predecessors.len() {
        Ok(order)
    } else {
        let placed: BTreeSet<&NodeKey> = order.iter().collect();
        Err(predecessors
            .keys()
            .filter(|k| !placed.contains(k))
            .cloned()
            .collect())
    }
}

/// Collects declarations and builds a [`Dag`]
#[derive(Default)]
pub struct GraphBuilder<'a> {
    nodes: Vec<Node>,
    edges: Vec<(NodeKey, NodeKey)>,
    registry: Option<&'a CollaboratorRegistry>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Explicit edge: `before` reaches its phase before `after` starts
    pub fn edge(mut self, before: impl Into<NodeKey>, after: impl Into<NodeKey>) -> Self {
        self.edges.push((before.into(), after.into()));
        self
    }

    /// Source of module expanders
    pub fn with_modules(mut self, registry: &'a CollaboratorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Dag> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.key.clone()) {
                return Err(Error::DuplicateNode(node.key.clone()));
            }
        }

        let mut expanded = module::expand(self.nodes, self.edges, self.registry)?;

        let mut nodes: BTreeMap<NodeKey, Node> = BTreeMap::new();
        for node in expanded.nodes.drain(..) {
            if expanded.modules.contains_key(&node.key) {
                return Err(Error::DuplicateNode(node.key));
            }
            if nodes.contains_key(&node.key) {
                return Err(Error::DuplicateNode(node.key));
            }
            nodes.insert(node.key.clone(), node);
        }
        expanded.nodes = nodes.into_values().collect();
        module::link(&mut expanded)?;

        for node in &expanded.nodes {
            if node.kind == NodeKind::TimedBarrier {
                node.barrier_delays().map_err(|message| Error::InvalidConfig {
                    node: node.key.clone(),
                    message,
                })?;
            }
        }

        let keys: BTreeSet<NodeKey> = expanded.nodes.iter().map(|n| n.key.clone()).collect();

        // Reference scanning is independent per node
        let scanned: Vec<Result<Vec<NodeKey>>> = expanded
            .nodes
            .par_iter()
            .map(|node| referenced_nodes(node, &keys))
            .collect();

        let mut edges: BTreeMap<(NodeKey, NodeKey), EdgeKind> = BTreeMap::new();
        let mut references: BTreeMap<NodeKey, BTreeSet<NodeKey>> = BTreeMap::new();
        for (node, targets) in expanded.nodes.iter().zip(scanned) {
            for target in targets? {
                edges.insert((target.clone(), node.key.clone()), EdgeKind::Inferred);
                references.entry(node.key.clone()).or_default().insert(target);
            }
        }

        for node in &expanded.nodes {
            for dep in &node.depends_on {
                if !keys.contains(dep) {
                    return Err(Error::ConfigMismatch {
                        node: node.key.clone(),
                        reference: dep.to_string(),
                    });
                }
                edges.insert((dep.clone(), node.key.clone()), EdgeKind::Explicit);
            }
        }

        for (before, after) in &expanded.edges {
            for (node, other) in [(after, before), (before, after)] {
                if !keys.contains(other) {
                    return Err(Error::ConfigMismatch {
                        node: node.clone(),
                        reference: other.to_string(),
                    });
                }
            }
            edges.insert((before.clone(), after.clone()), EdgeKind::Explicit);
        }

        let mut nodes: BTreeMap<NodeKey, Node> = expanded
            .nodes
            .into_iter()
            .map(|mut n| {
                n.depends_on.clear();
                (n.key.clone(), n)
            })
            .collect();
        let mut dependents: BTreeMap<NodeKey, BTreeSet<NodeKey>> =
            nodes.keys().map(|k| (k.clone(), BTreeSet::new())).collect();

        for (before, after) in edges.keys() {
            if let Some(node) = nodes.get_mut(after) {
                node.depends_on.insert(before.clone());
            }
            if let Some(set) = dependents.get_mut(before) {
                set.insert(after.clone());
            }
        }

        if let Some(cycle) = find_cycle(&dependents) {
            return Err(Error::Cycle { cycle });
        }

        log::debug!("Built graph with {} nodes and {} edges", nodes.len(), edges.len());

        Ok(Dag {
            nodes,
            edges,
            dependents,
            references,
        })
    }
}

/// Nodes referenced from a node's configuration
fn referenced_nodes(node: &Node, keys: &BTreeSet<NodeKey>) -> Result<Vec<NodeKey>> {
    reference::collect(&node.config)
        .into_iter()
        .map(|path| {
            reference::split(&path, |k| keys.contains(k))
                .map(|(key, _)| NodeKey::from(key))
                .ok_or_else(|| Error::ConfigMismatch {
                    node: node.key.clone(),
                    reference: path.clone(),
                })
        })
        .collect()
}
