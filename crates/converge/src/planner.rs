//! Planner: DAG + prior state in, ordered [`Plan`] out
//!
//! Planning is a pure function. Identical inputs give byte-identical plans, so
//! a plan saved with `plan --out` can be compared or applied later.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::diff::{DiffReason, DiffSummary, diff_node, teardown_action};
use crate::error::{Error, Result};
use crate::graph::{Dag, topological_sort};
use crate::resource::{Config, NodeKey, NodeKind, Timeouts};
use crate::types::Action;
use ledger::{State, StateRecord};

/// Which direction a plan converges in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    Apply,
    Destroy,
}

/// One (node, action) pair of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub key: NodeKey,
    pub kind: NodeKind,
    pub resource_type: String,
    pub action: Action,
    pub reason: DiffReason,
    /// Steps that must succeed before this one starts (all earlier in the plan)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<NodeKey>,
    /// Desired configuration, unresolved; empty for teardown
    #[serde(default, skip_serializing_if = "Config::is_empty")]
    pub config: Config,
    pub config_hash: String,
    /// Dependencies to record in state on success
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<NodeKey>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl PlanStep {
    /// Timeout that applies to this step, if the node configures one
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeouts.for_action(&self.action)
    }
}

/// A node left out of the executable steps because a dependency is unusable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedStep {
    pub key: NodeKey,
    /// What would have been done
    pub action: Action,
    /// The excluded (or itself blocked) dependency responsible
    pub dependency: NodeKey,
}

/// An ordered set of steps computed against one state serial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub mode: PlanMode,
    /// State serial the plan was computed from
    pub serial: u64,
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<BlockedStep>,
}

impl Plan {
    pub fn step(&self, key: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.key.as_str() == key)
    }

    /// Keys in plan order
    pub fn keys(&self) -> Vec<&NodeKey> {
        self.steps.iter().map(|s| &s.key).collect()
    }

    /// Steps that change something
    pub fn changes(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.action.is_change())
    }

    pub fn has_changes(&self) -> bool {
        self.changes().next().is_some()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary::from_plan(self)
    }

    /// Pretty JSON, stable for identical plans
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Planning options
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Restrict planning to matching nodes; empty means everything
    ///
    /// A target matches a node by exact key, by key prefix (`module.eks`
    /// matches every member), or by resource type (`aws_subnet`).
    pub targets: Vec<String>,
}

impl PlanOptions {
    pub fn with_targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    fn selects(&self, key: &NodeKey, resource_type: &str) -> bool {
        self.targets.is_empty()
            || self
                .targets
                .iter()
                .any(|t| matches_target(key, resource_type, t))
    }
}

/// Check if a node matches a target filter
fn matches_target(key: &NodeKey, resource_type: &str, target: &str) -> bool {
    key.as_str() == target || key.is_within(&NodeKey::from(target)) || resource_type == target
}

/// Plan an apply run
///
/// Orphan destroys come first (dependents before dependencies, per the
/// recorded edges), then the DAG in topological order.
pub fn plan(dag: &Dag, state: &State, options: &PlanOptions) -> Result<Plan> {
    let orphans: BTreeMap<NodeKey, &StateRecord> = state
        .iter()
        .filter(|r| !dag.contains(&r.key))
        .map(|r| (NodeKey::from(r.key.as_str()), r))
        .filter(|(key, r)| options.selects(key, &r.resource_type))
        .collect();

    let mut steps = teardown_steps(&orphans, DiffReason::Orphaned)?;

    // An orphan's destroy precedes the apply step of every node it depended on
    let mut orphan_dependents: BTreeMap<&str, Vec<NodeKey>> = BTreeMap::new();
    for (key, record) in &orphans {
        for dep in &record.dependencies {
            if dag.contains(dep) {
                orphan_dependents.entry(dep.as_str()).or_default().push(key.clone());
            }
        }
    }

    let selected: BTreeSet<&NodeKey> = dag
        .nodes()
        .filter(|n| options.selects(&n.key, &n.resource_type))
        .map(|n| &n.key)
        .collect();

    let mut blocked: Vec<BlockedStep> = Vec::new();
    let mut blocked_keys: BTreeSet<NodeKey> = BTreeSet::new();
    let mut changing: BTreeSet<NodeKey> = BTreeSet::new();

    for key in dag.topological_order() {
        if !selected.contains(&key) {
            continue;
        }
        let Some(node) = dag.node(key.as_str()) else {
            continue;
        };
        let (mut action, mut reason) = diff_node(node, state.get(key.as_str()));
        // Resolved values may differ once a referenced node is rewritten
        if action == Action::NoOp && dag.references(key.as_str()).any(|r| changing.contains(r)) {
            action = Action::Update;
            reason = DiffReason::DependencyChanged;
        }

        let culprit = node.depends_on.iter().find(|dep| {
            if blocked_keys.contains(*dep) {
                true
            } else if selected.contains(dep) {
                false
            } else {
                !state
                    .get(dep.as_str())
                    .is_some_and(|r| r.status.is_healthy())
            }
        });
        if let Some(dependency) = culprit {
            log::debug!("Blocking {key}: dependency {dependency} is not available");
            blocked.push(BlockedStep {
                key: key.clone(),
                action,
                dependency: dependency.clone(),
            });
            blocked_keys.insert(key);
            continue;
        }

        let mut after: Vec<NodeKey> = orphan_dependents.remove(key.as_str()).unwrap_or_default();
        after.extend(
            node.depends_on
                .iter()
                .filter(|dep| selected.contains(dep))
                .cloned(),
        );

        if matches!(action, Action::Create | Action::Update) {
            changing.insert(key.clone());
        }
        steps.push(PlanStep {
            key: key.clone(),
            kind: node.kind,
            resource_type: node.resource_type.clone(),
            action,
            reason,
            after,
            config: node.config.clone(),
            config_hash: node.config_hash(),
            dependencies: node.depends_on.clone(),
            timeouts: node.timeouts,
        });
    }

    Ok(Plan {
        mode: PlanMode::Apply,
        serial: state.serial,
        steps,
        blocked,
    })
}

/// Plan a destroy run over recorded state
///
/// The order is the exact reverse of the apply order of the recorded graph.
/// Targets expand to their transitive dependents.
pub fn plan_destroy(state: &State, options: &PlanOptions) -> Result<Plan> {
    let records: BTreeMap<NodeKey, &StateRecord> = state
        .iter()
        .map(|r| (NodeKey::from(r.key.as_str()), r))
        .collect();

    let mut selected: BTreeSet<NodeKey> = records
        .iter()
        .filter(|(key, r)| options.selects(key, &r.resource_type))
        .map(|(key, _)| key.clone())
        .collect();

    if !options.targets.is_empty() {
        let dependents = recorded_dependents(&records);
        let mut stack: Vec<NodeKey> = selected.iter().cloned().collect();
        while let Some(key) = stack.pop() {
            for dependent in dependents.get(&key).into_iter().flatten() {
                if selected.insert(dependent.clone()) {
                    stack.push(dependent.clone());
                }
            }
        }
    }

    let records: BTreeMap<NodeKey, &StateRecord> = records
        .into_iter()
        .filter(|(key, _)| selected.contains(key))
        .collect();

    Ok(Plan {
        mode: PlanMode::Destroy,
        serial: state.serial,
        steps: teardown_steps(&records, DiffReason::Requested)?,
        blocked: Vec::new(),
    })
}

/// Teardown steps for a set of records, dependents first
fn teardown_steps(records: &BTreeMap<NodeKey, &StateRecord>, reason: DiffReason) -> Result<Vec<PlanStep>> {
    let predecessors: BTreeMap<NodeKey, BTreeSet<NodeKey>> = records
        .iter()
        .map(|(key, r)| {
            let deps = r.dependencies.iter().map(|d| NodeKey::from(d.as_str())).collect();
            (key.clone(), deps)
        })
        .collect();

    let mut order = topological_sort(&predecessors).map_err(|stuck| {
        let keys: Vec<&str> = stuck.iter().map(NodeKey::as_str).collect();
        Error::StateCorruption(format!(
            "recorded dependencies form a cycle among: {}",
            keys.join(", ")
        ))
    })?;
    order.reverse();

    let dependents = recorded_dependents(records);

    Ok(order
        .into_iter()
        .filter_map(|key| {
            let record = records.get(&key)?;
            let after = dependents.get(&key).cloned().unwrap_or_default();
            Some(PlanStep {
                kind: record.kind,
                resource_type: record.resource_type.clone(),
                action: teardown_action(record),
                reason,
                after: after.into_iter().collect(),
                config: Config::new(),
                config_hash: record.config_hash.clone(),
                dependencies: BTreeSet::new(),
                timeouts: Timeouts {
                    delete: record.delete_timeout,
                    ..Timeouts::default()
                },
                key,
            })
        })
        .collect())
}

/// Reverse of the recorded dependency edges, restricted to `records`
fn recorded_dependents(records: &BTreeMap<NodeKey, &StateRecord>) -> BTreeMap<NodeKey, BTreeSet<NodeKey>> {
    let mut dependents: BTreeMap<NodeKey, BTreeSet<NodeKey>> = BTreeMap::new();
    for (key, record) in records {
        for dep in &record.dependencies {
            if records.contains_key(dep.as_str()) {
                dependents
                    .entry(NodeKey::from(dep.as_str()))
                    .or_default()
                    .insert(key.clone());
            }
        }
    }
    dependents
}
