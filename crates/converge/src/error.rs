//! Error types for graph building, planning, and execution.
//!
//! Two levels are distinguished. [`Error`] is run-level: it aborts before any
//! step executes (cycles, undeclared references, corrupt state). [`NodeError`]
//! is step-level: it marks one step and its transitive dependents as failed but
//! never stops sibling subtrees. [`CollaboratorError`] is what collaborator
//! implementations return; its [`ErrorCategory`] drives retries.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::duration::format_duration;
use crate::resource::NodeKey;

/// Categories of collaborator errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Throttling, connectivity, eventual consistency (retryable)
    Transient,
    /// Validation failures, missing permissions, conflicts
    Permanent,
}

impl ErrorCategory {
    /// Whether this error category is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Errors returned by collaborator implementations.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Temporary failure; the engine may retry
    #[error("transient: {0}")]
    Transient(String),

    /// Failure that retrying will not fix
    #[error("{0}")]
    Permanent(String),

    /// Any other error, treated as permanent
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollaboratorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CollaboratorError::Transient(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Run-level errors: fatal, raised before any step executes.
#[derive(Debug, Error)]
pub enum Error {
    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    Cycle {
        /// Nodes along the cycle; the first node is repeated at the end
        cycle: Vec<NodeKey>,
    },

    /// A node references or depends on a node that is not declared
    #[error("{node} references undeclared node {reference}")]
    ConfigMismatch { node: NodeKey, reference: String },

    /// Two declarations share one key
    #[error("duplicate node key: {0}")]
    DuplicateNode(NodeKey),

    /// A node's configuration is unusable by the engine
    #[error("invalid configuration for {node}: {message}")]
    InvalidConfig { node: NodeKey, message: String },

    /// A module boundary could not be expanded
    #[error("failed to expand module {module}: {message}")]
    ModuleExpansion { module: NodeKey, message: String },

    /// Persisted state cannot be trusted
    #[error("state corruption: {0}")]
    StateCorruption(String),

    /// State store I/O or locking failure
    #[error(transparent)]
    State(ledger::Error),

    /// The plan was computed against a different state serial
    #[error("plan was computed at state serial {planned} but state is now at {current}")]
    StalePlan { planned: u64, current: u64 },

    /// No collaborator is registered for a step
    #[error("no collaborator registered for {kind} nodes of type '{resource_type}' (needed by {node})")]
    MissingCollaborator {
        node: NodeKey,
        kind: ledger::NodeKind,
        resource_type: String,
    },
}

impl From<ledger::Error> for Error {
    fn from(err: ledger::Error) -> Self {
        if err.is_corruption() {
            Error::StateCorruption(err.to_string())
        } else {
            Error::State(err)
        }
    }
}

fn format_cycle(cycle: &[NodeKey]) -> String {
    cycle
        .iter()
        .map(NodeKey::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Step-level failures recorded in the execution report.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    /// The collaborator call did not complete in time
    Timeout { after: Duration },
    /// The collaborator reported an error
    Collaborator { message: String, attempts: u32 },
    /// An imperative action exited unsuccessfully
    ExitStatus { code: i32 },
    /// A `${...}` reference could not be resolved from dependency state
    UnresolvedReference { reference: String },
    /// A predecessor failed, so this step never ran
    Blocked { dependency: NodeKey },
    /// The run was cancelled before or during this step
    Cancelled,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Timeout { after } => {
                write!(f, "timed out after {}", format_duration(*after))
            }
            NodeError::Collaborator { message, attempts } if *attempts > 1 => {
                write!(f, "{message} (after {attempts} attempts)")
            }
            NodeError::Collaborator { message, .. } => write!(f, "{message}"),
            NodeError::ExitStatus { code } => write!(f, "exited with status {code}"),
            NodeError::UnresolvedReference { reference } => {
                write!(f, "unresolved reference ${{{reference}}}")
            }
            NodeError::Blocked { dependency } => {
                write!(f, "not attempted: dependency {dependency} failed")
            }
            NodeError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result type for run-level operations.
pub type Result<T> = std::result::Result<T, Error>;
