//! # Converge
//!
//! Dependency-graph planning and execution for declarative provisioning.
//!
//! This crate provides:
//! - [`Node`] / [`NodeKey`]: declared resources, imperative actions, module
//!   boundaries and timed barriers
//! - [`GraphBuilder`] / [`Dag`]: explicit and reference-inferred edges, module
//!   and dynamic-block expansion, cycle detection
//! - [`plan`] / [`plan_destroy`]: diff desired nodes against recorded state
//!   into an ordered [`Plan`]
//! - [`Executor`]: run a plan concurrently with timeouts, retries,
//!   cancellation and failure isolation
//!
//! State persistence lives in the `ledger` crate; collaborators that talk to
//! real infrastructure are plugged in through [`CollaboratorRegistry`].
//!
//! ## Example
//!
//! ```no_run
//! use converge::{CollaboratorRegistry, Executor, GraphBuilder, Node, PlanOptions, plan};
//! use ledger::{FileStore, Session};
//!
//! # async fn run(registry: CollaboratorRegistry) -> anyhow::Result<()> {
//! let dag = GraphBuilder::new()
//!     .node(Node::managed("vpc", "aws_vpc"))
//!     .node(Node::managed("subnet", "aws_subnet").with_config("vpc_id", "${vpc.id}".into()))
//!     .build()?;
//!
//! let store = FileStore::new(".terrace/state.json");
//! let mut session = Session::open(&store)?;
//! let plan = plan(&dag, session.state(), &PlanOptions::default())?;
//! let report = Executor::new(&registry).run(&plan, &mut session).await?;
//! println!("{:?}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod diff;
pub mod duration;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod reference;
pub mod resource;
pub mod retry;
pub mod types;

#[cfg(test)]
mod testing;

pub use context::{
    ActionCollaborator, CallContext, CollaboratorRegistry, ModuleExpander, ModuleExpansion,
    NoProgress, ProgressCallback, ProviderConfig, ResourceCollaborator,
};
pub use diff::{DiffReason, DiffSummary};
pub use error::{CollaboratorError, Error, ErrorCategory, NodeError, Result};
pub use executor::Executor;
pub use graph::{Dag, EdgeKind, GraphBuilder};
pub use planner::{BlockedStep, Plan, PlanMode, PlanOptions, PlanStep, plan, plan_destroy};
pub use resource::{Config, Node, NodeKey, NodeKind, Timeouts};
pub use retry::RetryConfig;
pub use types::{
    Action, ExecuteOptions, ExecuteSummary, ExecutionReport, RefreshReport, RunStatus, StepReport,
    StepStatus,
};
