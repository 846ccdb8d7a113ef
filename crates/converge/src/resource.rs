//! Resource model: the typed nodes the graph is built from
//!
//! A [`Node`] is one provisionable unit. Its configuration payload is opaque
//! to the engine except for `${...}` references (which become inferred edges)
//! and `dynamic` blocks (expanded at build time). Everything else is handed
//! to the collaborator unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::duration::{format_duration, human, parse_duration};
use crate::types::Action;

pub use ledger::NodeKind;

/// Opaque configuration payload
pub type Config = BTreeMap<String, Value>;

/// Stable node identity, conventionally `type.name`
///
/// Members of an expanded module are prefixed with the module's key, e.g.
/// `module.eks.aws_eks_cluster.this`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of a module member: `<self>.<inner>`
    pub fn child(&self, inner: &str) -> Self {
        Self(format!("{}.{}", self.0, inner))
    }

    /// Whether this key belongs to the given module (at any depth)
    pub fn is_within(&self, module: &NodeKey) -> bool {
        self.0.len() > module.0.len()
            && self.0.starts_with(&module.0)
            && self.0.as_bytes()[module.0.len()] == b'.'
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for NodeKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Per-phase operation timeouts; `None` falls back to the executor default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default, with = "human::option", skip_serializing_if = "Option::is_none")]
    pub create: Option<Duration>,
    #[serde(default, with = "human::option", skip_serializing_if = "Option::is_none")]
    pub update: Option<Duration>,
    #[serde(default, with = "human::option", skip_serializing_if = "Option::is_none")]
    pub delete: Option<Duration>,
}

impl Timeouts {
    /// Timeout that applies to an action, if configured
    pub fn for_action(&self, action: &Action) -> Option<Duration> {
        match action {
            Action::Create => self.create,
            Action::Update => self.update,
            Action::Destroy => self.delete,
            Action::NoOp | Action::Wait(_) => None,
        }
    }
}

/// Delays configured on a timed barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierDelays {
    /// Delay before dependents may be created (usually zero)
    pub create: Duration,
    /// Delay inserted between destroying dependents and destroying dependencies
    pub destroy: Duration,
}

/// Config key holding a barrier's destroy delay
pub const DESTROY_DURATION: &str = "destroy_duration";
/// Config key holding a barrier's create delay
pub const CREATE_DURATION: &str = "create_duration";

/// A provisionable unit with declared dependencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: NodeKey,
    pub kind: NodeKind,
    /// Selects the collaborator (managed resources) or expander (modules)
    pub resource_type: String,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub depends_on: BTreeSet<NodeKey>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Node {
    pub fn new(key: impl Into<NodeKey>, kind: NodeKind, resource_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            resource_type: resource_type.into(),
            config: Config::new(),
            depends_on: BTreeSet::new(),
            timeouts: Timeouts::default(),
        }
    }

    /// A managed resource handled by the collaborator for `resource_type`
    pub fn managed(key: impl Into<NodeKey>, resource_type: impl Into<String>) -> Self {
        Self::new(key, NodeKind::ManagedResource, resource_type)
    }

    /// An imperative action (shell-like invocation)
    pub fn action(key: impl Into<NodeKey>) -> Self {
        Self::new(key, NodeKind::ImperativeAction, "action")
    }

    /// A module call expanded by the expander registered for `resource_type`
    pub fn module(key: impl Into<NodeKey>, resource_type: impl Into<String>) -> Self {
        Self::new(key, NodeKind::ModuleBoundary, resource_type)
    }

    /// A timed barrier delaying teardown by `destroy`
    pub fn barrier(key: impl Into<NodeKey>, destroy: Duration) -> Self {
        Self::new(key, NodeKind::TimedBarrier, "time_sleep")
            .with_config(DESTROY_DURATION, Value::String(format_duration(destroy)))
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn depends_on(mut self, key: impl Into<NodeKey>) -> Self {
        self.depends_on.insert(key.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Parse barrier delays from the configuration
    pub fn barrier_delays(&self) -> Result<BarrierDelays, String> {
        barrier_delays(&self.config)
    }

    /// Hash of the unresolved desired configuration
    pub fn config_hash(&self) -> String {
        config_hash(self.kind, &self.resource_type, &self.config)
    }
}

/// Parse barrier delays out of a config mapping
pub fn barrier_delays(config: &Config) -> Result<BarrierDelays, String> {
    let read = |key: &str| -> Result<Option<Duration>, String> {
        match config.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => parse_duration(s).map(Some),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| format!("{key} must be a non-negative number of seconds")),
            Some(other) => Err(format!("{key} must be a duration string, got {other}")),
        }
    };

    let destroy = read(DESTROY_DURATION)?.ok_or_else(|| format!("{DESTROY_DURATION} is required"))?;
    let create = read(CREATE_DURATION)?.unwrap_or(Duration::ZERO);
    Ok(BarrierDelays { create, destroy })
}

/// blake3 over the canonical JSON of (kind, type, config)
pub fn config_hash(kind: NodeKind, resource_type: &str, config: &Config) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update(&[0]);
    hasher.update(resource_type.as_bytes());
    hasher.update(&[0]);
    // BTreeMap and serde_json's default map both serialize in key order
    let canonical = serde_json::to_vec(config).unwrap_or_default();
    hasher.update(&canonical);
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_key_within() {
        let module = NodeKey::from("module.eks");
        assert!(NodeKey::from("module.eks.aws_eks_cluster.this").is_within(&module));
        assert!(!NodeKey::from("module.eks").is_within(&module));
        assert!(!NodeKey::from("module.eksctl.x").is_within(&module));
        assert_eq!(module.child("aws_iam_role.node").as_str(), "module.eks.aws_iam_role.node");
    }

    #[test]
    fn test_config_hash_is_stable_and_sensitive() {
        let a = Node::managed("aws_vpc.main", "aws_vpc")
            .with_config("cidr", json!("10.0.0.0/16"))
            .with_config("tags", json!({"b": 1, "a": 2}));
        let b = Node::managed("aws_vpc.main", "aws_vpc")
            .with_config("tags", json!({"a": 2, "b": 1}))
            .with_config("cidr", json!("10.0.0.0/16"));
        assert_eq!(a.config_hash(), b.config_hash());

        let c = a.clone().with_config("cidr", json!("10.1.0.0/16"));
        assert_ne!(a.config_hash(), c.config_hash());
    }

    #[test]
    fn test_config_hash_ignores_dependencies() {
        let a = Node::managed("x.y", "null");
        let b = Node::managed("x.y", "null").depends_on("z.w");
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn test_barrier_delays() {
        let node = Node::barrier("time_sleep.lb", Duration::from_secs(90));
        let delays = node.barrier_delays().unwrap();
        assert_eq!(delays.destroy, Duration::from_secs(90));
        assert_eq!(delays.create, Duration::ZERO);

        let node = node.with_config(CREATE_DURATION, json!(30));
        assert_eq!(node.barrier_delays().unwrap().create, Duration::from_secs(30));

        let bad = Node::new("time_sleep.x", NodeKind::TimedBarrier, "time_sleep");
        assert!(bad.barrier_delays().is_err());

        let bad = bad.with_config(DESTROY_DURATION, json!("soon"));
        assert!(bad.barrier_delays().is_err());
    }

    #[test]
    fn test_timeouts_for_action() {
        let timeouts = Timeouts {
            delete: Some(Duration::from_secs(1800)),
            ..Timeouts::default()
        };
        assert_eq!(timeouts.for_action(&Action::Destroy), Some(Duration::from_secs(1800)));
        assert_eq!(timeouts.for_action(&Action::Create), None);
    }
}
