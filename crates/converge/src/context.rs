//! Collaborator contracts and the registry that dispatches to them
//!
//! The engine performs no cloud or cluster calls itself. Everything that
//! touches the outside world goes through these traits, so the crate can be
//! driven by real providers, the CLI's built-ins, or test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::CollaboratorError;
use crate::planner::PlanStep;
use crate::resource::{Config, Node, NodeKey, NodeKind};
use crate::types::StepReport;

/// Provider settings handed to every collaborator call
///
/// Opaque to the engine. Passed explicitly at run start instead of being read
/// from the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderConfig(serde_json::Map<String, Value>);

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<serde_json::Map<String, Value>> for ProviderConfig {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Per-call context
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Node being operated on
    pub key: NodeKey,
    pub resource_type: String,
    pub provider: Arc<ProviderConfig>,
    /// Cancelled when the run is cancelled or the step times out
    pub cancel: CancellationToken,
}

/// Collaborator for managed resources
#[async_trait]
pub trait ResourceCollaborator: Send + Sync {
    /// Create the resource and return its observed state blob
    async fn create(&self, ctx: &CallContext, config: &Config) -> Result<Value, CollaboratorError>;

    /// Converge an existing resource to `config`
    async fn update(
        &self,
        ctx: &CallContext,
        current: &Value,
        config: &Config,
    ) -> Result<Value, CollaboratorError>;

    async fn destroy(&self, ctx: &CallContext, current: &Value) -> Result<(), CollaboratorError>;

    /// Observe the live resource; `None` means it no longer exists
    async fn read(&self, _ctx: &CallContext, current: &Value) -> Result<Option<Value>, CollaboratorError> {
        Ok(Some(current.clone()))
    }
}

/// Collaborator for imperative actions (shell-like invocations)
#[async_trait]
pub trait ActionCollaborator: Send + Sync {
    /// Run the action and return its exit status
    ///
    /// `timeout` is informational: the engine enforces it regardless and
    /// cancels `ctx.cancel` on expiry.
    async fn run(
        &self,
        ctx: &CallContext,
        config: &Config,
        timeout: Duration,
    ) -> Result<i32, CollaboratorError>;
}

/// What a module boundary expands into
///
/// Keys, references and edges are module-local; the graph builder prefixes
/// them with the module's key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleExpansion {
    pub nodes: Vec<Node>,
    /// Extra `(before, after)` edges between module nodes
    pub edges: Vec<(NodeKey, NodeKey)>,
    /// Output name to expression, e.g. `cluster_name` -> `${aws_eks_cluster.this.name}`
    pub outputs: BTreeMap<String, String>,
}

/// Expands a module boundary at graph build time
pub trait ModuleExpander: Send + Sync {
    fn expand(&self, config: &Config) -> Result<ModuleExpansion, CollaboratorError>;
}

/// Progress callback for execution
///
/// Implement this trait to receive progress updates during a run. Calls come
/// from the scheduling loop and from step tasks, hence `&self`.
pub trait ProgressCallback: Send + Sync {
    /// Called when the run starts with the number of executable steps
    fn on_run_start(&self, _steps: usize) {}

    /// Called when a step starts executing
    fn on_step_start(&self, _step: &PlanStep) {}

    /// Called before a transient failure is retried
    fn on_step_retry(&self, _key: &NodeKey, _attempt: u32, _max_attempts: u32, _error: &CollaboratorError) {}

    /// Called once per step with its final report
    fn on_step_complete(&self, _report: &StepReport) {}
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {}

/// Maps node kinds and resource types to collaborators
#[derive(Default)]
pub struct CollaboratorRegistry {
    resources: BTreeMap<String, Arc<dyn ResourceCollaborator>>,
    fallback: Option<Arc<dyn ResourceCollaborator>>,
    action: Option<Arc<dyn ActionCollaborator>>,
    expanders: BTreeMap<String, Arc<dyn ModuleExpander>>,
    provider: Arc<ProviderConfig>,
}

impl CollaboratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the collaborator for one resource type
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        collaborator: impl ResourceCollaborator + 'static,
    ) -> Self {
        self.resources
            .insert(resource_type.into(), Arc::new(collaborator));
        self
    }

    /// Collaborator for resource types with no specific registration
    pub fn with_fallback(mut self, collaborator: impl ResourceCollaborator + 'static) -> Self {
        self.fallback = Some(Arc::new(collaborator));
        self
    }

    pub fn with_action(mut self, collaborator: impl ActionCollaborator + 'static) -> Self {
        self.action = Some(Arc::new(collaborator));
        self
    }

    pub fn with_expander(
        mut self,
        resource_type: impl Into<String>,
        expander: impl ModuleExpander + 'static,
    ) -> Self {
        self.expanders
            .insert(resource_type.into(), Arc::new(expander));
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = Arc::new(provider);
        self
    }

    pub fn resource(&self, resource_type: &str) -> Option<Arc<dyn ResourceCollaborator>> {
        self.resources
            .get(resource_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn action(&self) -> Option<Arc<dyn ActionCollaborator>> {
        self.action.clone()
    }

    pub fn expander(&self, resource_type: &str) -> Option<&dyn ModuleExpander> {
        self.expanders.get(resource_type).map(AsRef::as_ref)
    }

    pub fn provider(&self) -> Arc<ProviderConfig> {
        Arc::clone(&self.provider)
    }

    /// Whether a step of this kind and type can be dispatched
    pub fn supports(&self, kind: NodeKind, resource_type: &str) -> bool {
        match kind {
            NodeKind::ManagedResource => self.resource(resource_type).is_some(),
            NodeKind::ImperativeAction => self.action.is_some(),
            NodeKind::ModuleBoundary => self.expanders.contains_key(resource_type),
            NodeKind::TimedBarrier => true,
        }
    }
}

impl fmt::Debug for CollaboratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollaboratorRegistry")
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .field("action", &self.action.is_some())
            .field("expanders", &self.expanders.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
