//! Core types for planning and execution results

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::duration::{format_duration, human};
use crate::error::NodeError;
use crate::resource::NodeKey;
use crate::retry::RetryConfig;

/// What a plan step does to its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Node has no record yet
    Create,
    /// Configuration changed, record is tainted/failed, or drift was observed
    Update,
    /// Node left the graph (or a destroy run)
    Destroy,
    /// Record matches the desired configuration
    NoOp,
    /// Timed barrier on destroy: sleep before dependencies are destroyed
    Wait(#[serde(with = "human")] Duration),
}

impl Action {
    /// Symbol used when rendering plans
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update => "~",
            Action::Destroy => "-",
            Action::NoOp => " ",
            Action::Wait(_) => "⏱",
        }
    }

    /// Whether the step changes anything
    pub fn is_change(&self) -> bool {
        !matches!(self, Action::NoOp)
    }

    /// Whether the step tears something down
    pub fn is_teardown(&self) -> bool {
        matches!(self, Action::Destroy | Action::Wait(_))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::Destroy => write!(f, "destroy"),
            Action::NoOp => write!(f, "no-op"),
            Action::Wait(d) => write!(f, "wait {}", format_duration(*d)),
        }
    }
}

/// Lifecycle of a step during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    /// A predecessor failed; never attempted
    Blocked,
    /// Not started (or interrupted) because the run was cancelled
    Cancelled,
    /// Dry run
    Skipped,
}

impl StepStatus {
    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running | Self::Retrying)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Blocked => "blocked",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Final outcome of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub key: NodeKey,
    pub action: Action,
    pub status: StepStatus,
    pub error: Option<NodeError>,
    /// Collaborator attempts made (0 when never started)
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Every step's final status, in plan order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
}

impl ExecutionReport {
    pub(crate) fn from_steps(steps: Vec<StepReport>, cancelled: bool) -> Self {
        let status = if steps.iter().all(|s| s.status.is_success()) {
            RunStatus::Succeeded
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        Self { status, steps }
    }

    pub fn step(&self, key: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.key.as_str() == key)
    }

    pub fn status_of(&self, key: &str) -> Option<StepStatus> {
        self.step(key).map(|s| s.status)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Steps that failed or were blocked
    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Blocked))
    }

    /// Counts per outcome
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for step in &self.steps {
            summary.add(step);
        }
        summary
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub destroyed: usize,
    pub waited: usize,
    pub no_change: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.destroyed
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.cancelled == 0
    }

    fn add(&mut self, step: &StepReport) {
        match step.status {
            StepStatus::Succeeded => match step.action {
                Action::Create => self.created += 1,
                Action::Update => self.updated += 1,
                Action::Destroy => self.destroyed += 1,
                Action::Wait(_) => self.waited += 1,
                Action::NoOp => self.no_change += 1,
            },
            StepStatus::Failed => self.failed += 1,
            StepStatus::Blocked => self.blocked += 1,
            StepStatus::Cancelled => self.cancelled += 1,
            StepStatus::Skipped => self.skipped += 1,
            StepStatus::Pending | StepStatus::Running | StepStatus::Retrying => {}
        }
    }
}

/// Outcome of a refresh (drift detection) pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    /// Records whose live state differs from the recorded blob
    pub drifted: Vec<NodeKey>,
    /// Records whose resource no longer exists; removed from state
    pub vanished: Vec<NodeKey>,
    /// Records that still match
    pub unchanged: Vec<NodeKey>,
    /// Records that could not be read
    pub errors: Vec<(NodeKey, NodeError)>,
}

impl RefreshReport {
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.vanished.is_empty()
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't invoke collaborators or write state, just report
    pub dry_run: bool,
    /// Maximum number of steps in flight
    pub jobs: usize,
    /// Timeout for steps whose node sets none
    pub default_timeout: Duration,
    /// Retry policy for transient collaborator errors
    pub retry: RetryConfig,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            default_timeout: Duration::from_secs(20 * 60),
            retry: RetryConfig::default(),
        }
    }
}
