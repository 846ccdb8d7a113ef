//! Diff computation: desired node vs. recorded state

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::planner::{Plan, PlanStep};
use crate::resource::{Config, Node, barrier_delays};
use crate::types::Action;
use ledger::{NodeKind, RecordStatus, StateRecord};

/// Why a node gets the action it gets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffReason {
    /// No record exists
    New,
    /// Configuration hash differs from the recorded one
    ConfigChanged,
    /// Last update failed
    Tainted,
    /// Last destroy failed
    Failed,
    /// Refresh observed a live state different from the record
    Drifted,
    /// A referenced node is created or updated in the same plan
    DependencyChanged,
    /// Recorded but no longer declared
    Orphaned,
    /// Destroy run
    Requested,
    Unchanged,
}

impl fmt::Display for DiffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffReason::New => "new",
            DiffReason::ConfigChanged => "configuration changed",
            DiffReason::Tainted => "tainted",
            DiffReason::Failed => "previous destroy failed",
            DiffReason::Drifted => "drift detected",
            DiffReason::DependencyChanged => "referenced node changes",
            DiffReason::Orphaned => "no longer declared",
            DiffReason::Requested => "destroy requested",
            DiffReason::Unchanged => "unchanged",
        };
        write!(f, "{s}")
    }
}

/// Action and reason for a declared node
pub fn diff_node(node: &Node, record: Option<&StateRecord>) -> (Action, DiffReason) {
    let Some(record) = record else {
        return (Action::Create, DiffReason::New);
    };

    match record.status {
        RecordStatus::Tainted => return (Action::Update, DiffReason::Tainted),
        RecordStatus::Failed => return (Action::Update, DiffReason::Failed),
        RecordStatus::Healthy => {}
    }

    if record.config_hash != node.config_hash() {
        (Action::Update, DiffReason::ConfigChanged)
    } else if record.drifted {
        (Action::Update, DiffReason::Drifted)
    } else {
        (Action::NoOp, DiffReason::Unchanged)
    }
}

/// Teardown action for a recorded node: `Wait` for barriers, `Destroy` otherwise
pub fn teardown_action(record: &StateRecord) -> Action {
    if record.kind != NodeKind::TimedBarrier {
        return Action::Destroy;
    }

    let recorded: Config = record
        .blob
        .as_object()
        .map(|blob| blob.clone().into_iter().collect())
        .unwrap_or_default();
    match barrier_delays(&recorded) {
        Ok(delays) => Action::Wait(delays.destroy),
        Err(e) => {
            log::warn!("Barrier {} has no usable destroy duration ({e}); not waiting", record.key);
            Action::Wait(std::time::Duration::ZERO)
        }
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    /// Number of nodes to create
    pub additions: usize,
    /// Number of nodes to destroy
    pub removals: usize,
    /// Number of nodes to update
    pub modifications: usize,
    /// Number of barrier waits
    pub waits: usize,
    /// Number of nodes that need nothing
    pub unchanged: usize,
    /// Number of nodes that cannot be planned
    pub blocked: usize,
}

impl DiffSummary {
    /// Create a summary from a plan
    pub fn from_plan(plan: &Plan) -> Self {
        let mut summary = Self {
            blocked: plan.blocked.len(),
            ..Self::default()
        };
        for step in &plan.steps {
            match step.action {
                Action::Create => summary.additions += 1,
                Action::Destroy => summary.removals += 1,
                Action::Update => summary.modifications += 1,
                Action::Wait(_) => summary.waits += 1,
                Action::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications + self.waits
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group changing steps by resource type
pub fn group_by_type(plan: &Plan) -> BTreeMap<&str, Vec<&PlanStep>> {
    let mut groups: BTreeMap<&str, Vec<&PlanStep>> = BTreeMap::new();
    for step in plan.steps.iter().filter(|s| s.action.is_change()) {
        groups.entry(step.resource_type.as_str()).or_default().push(step);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn recorded(node: &Node) -> StateRecord {
        StateRecord::new(node.key.as_str(), node.kind, node.resource_type.clone())
            .with_hash(node.config_hash())
    }

    #[test]
    fn test_diff_node() {
        let node = Node::managed("aws_vpc.main", "aws_vpc").with_config("cidr", json!("10.0.0.0/16"));
        assert_eq!(diff_node(&node, None), (Action::Create, DiffReason::New));

        let mut record = recorded(&node);
        assert_eq!(diff_node(&node, Some(&record)), (Action::NoOp, DiffReason::Unchanged));

        record.drifted = true;
        assert_eq!(diff_node(&node, Some(&record)), (Action::Update, DiffReason::Drifted));
        record.drifted = false;

        record.transition(RecordStatus::Tainted);
        assert_eq!(diff_node(&node, Some(&record)), (Action::Update, DiffReason::Tainted));

        let changed = node.clone().with_config("cidr", json!("10.1.0.0/16"));
        let record = recorded(&node);
        assert_eq!(diff_node(&changed, Some(&record)), (Action::Update, DiffReason::ConfigChanged));
    }

    #[test]
    fn test_teardown_action() {
        let record = StateRecord::new("aws_vpc.main", NodeKind::ManagedResource, "aws_vpc");
        assert_eq!(teardown_action(&record), Action::Destroy);

        let record = StateRecord::new("lb_barrier", NodeKind::TimedBarrier, "time_sleep")
            .with_blob(json!({"destroy_duration": "90s"}));
        assert_eq!(teardown_action(&record), Action::Wait(Duration::from_secs(90)));
    }
}
