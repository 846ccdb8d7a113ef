//! Execution engine: runs a plan as a DAG of async steps
//!
//! Ready steps start in plan order, at most `jobs` at a time. Each step is a
//! tokio task that dispatches to its collaborator under a timeout and a child
//! cancellation token. The scheduling loop is the only writer to the state
//! session; it records each step's effect as soon as the step completes.

use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::{
    ActionCollaborator, CallContext, CollaboratorRegistry, NoProgress, ProgressCallback,
    ResourceCollaborator,
};
use crate::error::{CollaboratorError, Error, NodeError, Result};
use crate::planner::{Plan, PlanStep};
use crate::reference;
use crate::resource::{CREATE_DURATION, Config, DESTROY_DURATION, NodeKey, NodeKind, barrier_delays};
use crate::retry::{RetryCallback, RetryConfig, with_retry};
use crate::types::{
    Action, ExecuteOptions, ExecutionReport, RefreshReport, StepReport, StepStatus,
};
use ledger::{RecordStatus, Session, State, StateRecord};

/// Runs plans against a collaborator registry
pub struct Executor<'a> {
    registry: &'a CollaboratorRegistry,
    options: ExecuteOptions,
    progress: Arc<dyn ProgressCallback>,
    cancel: CancellationToken,
}

/// What a step task does
enum Work {
    Resource {
        collaborator: Arc<dyn ResourceCollaborator>,
        action: Action,
        config: Config,
        prior: Value,
        retry: RetryConfig,
    },
    Action {
        collaborator: Arc<dyn ActionCollaborator>,
        config: Config,
        timeout: Duration,
    },
    Sleep {
        duration: Duration,
        blob: Value,
    },
}

/// Result of one step, before it is turned into a report
struct Outcome {
    result: std::result::Result<Value, NodeError>,
    attempts: u32,
    elapsed: Duration,
}

impl Outcome {
    fn immediate(result: std::result::Result<Value, NodeError>) -> Self {
        Self {
            result,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// A failed attempt that will be retried
struct RetryEvent {
    index: usize,
    attempt: u32,
    max_attempts: u32,
    error: CollaboratorError,
}

/// Forwards retry notifications from a step task to the scheduling loop
struct RetryNotifier {
    index: usize,
    key: NodeKey,
    events: mpsc::UnboundedSender<RetryEvent>,
}

impl RetryCallback for RetryNotifier {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &CollaboratorError, delay: Duration) {
        log::warn!(
            "{}: attempt {attempt}/{max_attempts} failed ({error}), retrying in {delay:?}",
            self.key
        );
        let error = match error {
            CollaboratorError::Transient(message) => CollaboratorError::Transient(message.clone()),
            other => CollaboratorError::permanent(other.to_string()),
        };
        // The receiver outlives every task
        let _ = self.events.send(RetryEvent {
            index: self.index,
            attempt,
            max_attempts,
            error,
        });
    }
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a CollaboratorRegistry) -> Self {
        Self {
            registry,
            options: ExecuteOptions::default(),
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Token that cancels the run when triggered
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute a plan, recording every completed step in `session`
    ///
    /// Run-level problems (stale plan, missing collaborator, state write
    /// failure) return `Err`. Step failures are reported in the
    /// [`ExecutionReport`] and only affect the failed step's dependents.
    pub async fn run(&self, plan: &Plan, session: &mut Session<'_>) -> Result<ExecutionReport> {
        let current = session.state().serial;
        if plan.serial != current {
            return Err(Error::StalePlan {
                planned: plan.serial,
                current,
            });
        }
        self.check_collaborators(plan)?;

        self.progress.on_run_start(plan.steps.len());

        if self.options.dry_run {
            let mut reports: Vec<StepReport> = plan
                .steps
                .iter()
                .map(|step| report(step.key.clone(), step.action, StepStatus::Skipped, None, 0, Duration::ZERO))
                .collect();
            reports.extend(blocked_reports(plan));
            for r in &reports {
                self.progress.on_step_complete(r);
            }
            return Ok(ExecutionReport::from_steps(reports, false));
        }

        let mut run = Scheduler::new(plan);
        let mut tasks: JoinSet<(usize, Outcome)> = JoinSet::new();
        let mut in_flight: HashMap<Id, usize> = HashMap::new();
        let (retry_tx, mut retries) = mpsc::unbounded_channel::<RetryEvent>();
        let jobs = self.options.jobs.max(1);
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            while !cancelled && tasks.len() < jobs {
                let Some(index) = run.ready.pop_first() else {
                    break;
                };
                let step = &plan.steps[index];
                log::info!("{} {}: starting", step.action, step.key);
                self.progress.on_step_start(step);
                run.status[index] = StepStatus::Running;

                match self.prepare(step, session.state()) {
                    Ok(Some((work, limit))) => {
                        let handle = tasks.spawn(self.task(index, step, work, limit, retry_tx.clone()));
                        in_flight.insert(handle.id(), index);
                    }
                    Ok(None) => {
                        let outcome = Outcome::immediate(Ok(Value::Null));
                        self.complete(&mut run, plan, index, outcome, session)?;
                    }
                    Err(e) => {
                        self.complete(&mut run, plan, index, Outcome::immediate(Err(e)), session)?;
                    }
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled(), if !cancelled => {
                    log::warn!("Run cancelled; waiting for {} in-flight steps", tasks.len());
                    cancelled = true;
                }
                Some(event) = retries.recv() => {
                    run.retrying(event.index);
                    self.progress.on_step_retry(
                        &plan.steps[event.index].key,
                        event.attempt,
                        event.max_attempts,
                        &event.error,
                    );
                }
                joined = tasks.join_next_with_id() => {
                    match joined {
                        Some(Ok((id, (index, outcome)))) => {
                            in_flight.remove(&id);
                            self.complete(&mut run, plan, index, outcome, session)?;
                        }
                        Some(Err(e)) => match in_flight.remove(&e.id()) {
                            Some(index) => {
                                log::error!("{}: step task failed: {e}", plan.steps[index].key);
                                let outcome = Outcome::immediate(Err(NodeError::Collaborator {
                                    message: format!("step task failed: {e}"),
                                    attempts: 0,
                                }));
                                self.complete(&mut run, plan, index, outcome, session)?;
                            }
                            None => log::error!("Untracked step task failed: {e}"),
                        },
                        None => {}
                    }
                }
            }
        }

        cancelled |= self.cancel.is_cancelled();
        let unstarted: Vec<usize> = (0..plan.steps.len()).filter(|i| run.reports[*i].is_none()).collect();
        let mut reports = run.finish(plan);
        for i in unstarted {
            self.progress.on_step_complete(&reports[i]);
        }
        reports.extend(blocked_reports(plan));

        let report = ExecutionReport::from_steps(reports, cancelled);
        log::info!("Run {}: {:?}", report.status, report.summary());
        Ok(report)
    }

    /// Detect drift by reading every managed record
    ///
    /// Changed blobs are stored and flagged as drifted; records whose
    /// resource vanished are removed so the next plan re-creates them.
    pub async fn refresh(&self, session: &mut Session<'_>) -> Result<RefreshReport> {
        let records: Vec<StateRecord> = session
            .state()
            .iter()
            .filter(|r| r.kind == NodeKind::ManagedResource)
            .cloned()
            .collect();

        for record in &records {
            if self.registry.resource(&record.resource_type).is_none() {
                return Err(Error::MissingCollaborator {
                    node: NodeKey::from(record.key.as_str()),
                    kind: record.kind,
                    resource_type: record.resource_type.clone(),
                });
            }
        }

        let mut report = RefreshReport::default();
        for record in records {
            if self.cancel.is_cancelled() {
                break;
            }
            let key = NodeKey::from(record.key.as_str());
            let Some(collaborator) = self.registry.resource(&record.resource_type) else {
                continue;
            };
            let ctx = self.context(&key, &record.resource_type);
            let limit = self.options.default_timeout;

            let read = tokio::select! {
                () = self.cancel.cancelled() => Err(NodeError::Cancelled),
                r = tokio::time::timeout(limit, collaborator.read(&ctx, &record.blob)) => match r {
                    Ok(Ok(observed)) => Ok(observed),
                    Ok(Err(e)) => Err(NodeError::Collaborator { message: e.to_string(), attempts: 1 }),
                    Err(_) => Err(NodeError::Timeout { after: limit }),
                },
            };

            match read {
                Ok(Some(observed)) if observed == record.blob => report.unchanged.push(key),
                Ok(Some(observed)) => {
                    log::info!("{key}: drift detected");
                    session.update(|state| {
                        if let Some(r) = state.get_mut(&record.key) {
                            r.blob = observed;
                            r.drifted = true;
                        }
                    })?;
                    report.drifted.push(key);
                }
                Ok(None) => {
                    log::info!("{key}: resource no longer exists, forgetting it");
                    session.update(|state| state.remove(&record.key))?;
                    report.vanished.push(key);
                }
                Err(e) => {
                    log::warn!("{key}: refresh failed: {e}");
                    report.errors.push((key, e));
                }
            }
        }

        Ok(report)
    }

    fn check_collaborators(&self, plan: &Plan) -> Result<()> {
        for step in &plan.steps {
            let needed = match (step.kind, step.action) {
                (_, Action::NoOp | Action::Wait(_)) => false,
                (NodeKind::ManagedResource, _) => true,
                (NodeKind::ImperativeAction, Action::Create | Action::Update) => true,
                _ => false,
            };
            if needed && !self.registry.supports(step.kind, &step.resource_type) {
                return Err(Error::MissingCollaborator {
                    node: step.key.clone(),
                    kind: step.kind,
                    resource_type: step.resource_type.clone(),
                });
            }
        }
        Ok(())
    }

    fn context(&self, key: &NodeKey, resource_type: &str) -> CallContext {
        CallContext {
            key: key.clone(),
            resource_type: resource_type.to_string(),
            provider: self.registry.provider(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Decide what a step does; `None` means it completes without a task
    fn prepare(
        &self,
        step: &PlanStep,
        state: &State,
    ) -> std::result::Result<Option<(Work, Option<Duration>)>, NodeError> {
        let limit = step.timeout().unwrap_or(self.options.default_timeout);
        let prior = || state.get(step.key.as_str()).map(|r| r.blob.clone()).unwrap_or(Value::Null);

        let work = match (step.kind, step.action) {
            (_, Action::NoOp) => return Ok(None),
            (_, Action::Wait(duration)) => Work::Sleep {
                duration,
                blob: Value::Null,
            },
            (NodeKind::ManagedResource, Action::Destroy) => Work::Resource {
                collaborator: self.resource(step)?,
                action: Action::Destroy,
                config: Config::new(),
                prior: prior(),
                retry: self.options.retry.clone(),
            },
            (NodeKind::ManagedResource, action) => Work::Resource {
                collaborator: self.resource(step)?,
                action,
                config: resolve(&step.config, state)?,
                prior: prior(),
                retry: self.options.retry.clone(),
            },
            (NodeKind::ImperativeAction, Action::Create | Action::Update) => {
                let collaborator = self.registry.action().ok_or_else(|| NodeError::Collaborator {
                    message: "no action collaborator registered".to_string(),
                    attempts: 0,
                })?;
                Work::Action {
                    collaborator,
                    config: resolve(&step.config, state)?,
                    timeout: limit,
                }
            }
            (NodeKind::TimedBarrier, Action::Create | Action::Update) => {
                let delays = barrier_delays(&step.config).map_err(|message| NodeError::Collaborator {
                    message,
                    attempts: 0,
                })?;
                let blob: serde_json::Map<String, Value> = step
                    .config
                    .iter()
                    .filter(|(k, _)| matches!(k.as_str(), DESTROY_DURATION | CREATE_DURATION))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                return Ok(Some((
                    Work::Sleep {
                        duration: delays.create,
                        blob: Value::Object(blob),
                    },
                    None,
                )));
            }
            // Destroying an imperative action (or a barrier) only forgets it
            _ => return Ok(None),
        };

        let limit = match work {
            Work::Sleep { .. } => None,
            _ => Some(limit),
        };
        Ok(Some((work, limit)))
    }

    fn resource(&self, step: &PlanStep) -> std::result::Result<Arc<dyn ResourceCollaborator>, NodeError> {
        self.registry
            .resource(&step.resource_type)
            .ok_or_else(|| NodeError::Collaborator {
                message: format!("no collaborator for resource type '{}'", step.resource_type),
                attempts: 0,
            })
    }

    /// The future run as a step task
    fn task(
        &self,
        index: usize,
        step: &PlanStep,
        work: Work,
        limit: Option<Duration>,
        events: mpsc::UnboundedSender<RetryEvent>,
    ) -> impl std::future::Future<Output = (usize, Outcome)> + Send + 'static {
        let ctx = self.context(&step.key, &step.resource_type);
        let cancel = ctx.cancel.clone();
        let notifier = RetryNotifier {
            index,
            key: step.key.clone(),
            events,
        };

        async move {
            let started = Instant::now();
            let attempts = Arc::new(AtomicU32::new(0));
            let work = perform(work, &ctx, &notifier, Arc::clone(&attempts));

            let result = match limit {
                Some(limit) => tokio::select! {
                    () = cancel.cancelled() => Err(NodeError::Cancelled),
                    r = tokio::time::timeout(limit, work) => r.unwrap_or(Err(NodeError::Timeout { after: limit })),
                },
                None => tokio::select! {
                    () = cancel.cancelled() => Err(NodeError::Cancelled),
                    r = work => r,
                },
            };

            // Let anything the collaborator spawned observe the interruption
            if result.is_err() {
                cancel.cancel();
            }

            let outcome = Outcome {
                result,
                attempts: attempts.load(Ordering::SeqCst),
                elapsed: started.elapsed(),
            };
            (index, outcome)
        }
    }

    /// Record a finished step: state, report, and scheduling of dependents
    fn complete(
        &self,
        run: &mut Scheduler,
        plan: &Plan,
        index: usize,
        outcome: Outcome,
        session: &mut Session<'_>,
    ) -> Result<()> {
        let step = &plan.steps[index];
        let succeeded = outcome.result.is_ok();

        record_effect(step, &outcome.result, session)?;

        let (status, error) = match outcome.result {
            Ok(_) => (StepStatus::Succeeded, None),
            Err(NodeError::Cancelled) => (StepStatus::Cancelled, Some(NodeError::Cancelled)),
            Err(e) => (StepStatus::Failed, Some(e)),
        };

        match &error {
            None => log::info!("{} {}: done", step.action, step.key),
            Some(e) => log::warn!("{} {}: {e}", step.action, step.key),
        }

        let r = report(step.key.clone(), step.action, status, error, outcome.attempts, outcome.elapsed);
        self.progress.on_step_complete(&r);
        run.status[index] = status;
        run.reports[index] = Some(r);

        if succeeded {
            run.release(index);
        } else if status == StepStatus::Failed {
            for blocked in run.block_dependents(plan, index) {
                self.progress.on_step_complete(&blocked);
            }
        }
        Ok(())
    }
}

/// Dispatch a step's work to its collaborator
async fn perform(
    work: Work,
    ctx: &CallContext,
    notifier: &RetryNotifier,
    attempts: Arc<AtomicU32>,
) -> std::result::Result<Value, NodeError> {
    match work {
        Work::Resource {
            collaborator,
            action,
            config,
            prior,
            retry,
        } => {
            let retried = with_retry(&retry, Some(notifier), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                let (collaborator, config, prior) = (&collaborator, &config, &prior);
                async move {
                    match action {
                        Action::Create => collaborator.create(ctx, config).await,
                        Action::Update => collaborator.update(ctx, prior, config).await,
                        _ => collaborator.destroy(ctx, prior).await.map(|()| Value::Null),
                    }
                }
            })
            .await;

            retried.result.map_err(|e| NodeError::Collaborator {
                message: e.to_string(),
                attempts: retried.attempts,
            })
        }
        Work::Action {
            collaborator,
            config,
            timeout,
        } => {
            attempts.store(1, Ordering::SeqCst);
            match collaborator.run(ctx, &config, timeout).await {
                Ok(0) => Ok(json!({ "exit_status": 0 })),
                Ok(code) => Err(NodeError::ExitStatus { code }),
                Err(e) => Err(NodeError::Collaborator {
                    message: e.to_string(),
                    attempts: 1,
                }),
            }
        }
        Work::Sleep { duration, blob } => {
            if !duration.is_zero() {
                log::info!("{}: waiting {duration:?}", ctx.key);
                tokio::time::sleep(duration).await;
            }
            Ok(blob)
        }
    }
}

/// Resolve `${...}` references against recorded state blobs
fn resolve(config: &Config, state: &State) -> std::result::Result<Config, NodeError> {
    reference::transform_config(config, &mut |path: &str| {
        let unresolved = || NodeError::UnresolvedReference {
            reference: path.to_string(),
        };
        let (key, attrs) = reference::split(path, |k| state.contains(k)).ok_or_else(unresolved)?;
        let record = state.get(key).ok_or_else(unresolved)?;
        reference::lookup(&record.blob, &attrs)
            .cloned()
            .map(Some)
            .ok_or_else(unresolved)
    })
}

/// Persist what a finished step did
fn record_effect(
    step: &PlanStep,
    result: &std::result::Result<Value, NodeError>,
    session: &mut Session<'_>,
) -> Result<()> {
    let key = step.key.as_str();
    match (step.action, result) {
        (Action::NoOp, _) => {}
        (Action::Create | Action::Update, Ok(blob)) => {
            let record = StateRecord::new(key, step.kind, step.resource_type.clone())
                .with_hash(step.config_hash.clone())
                .with_blob(blob.clone())
                .with_dependencies(step.dependencies.iter().map(NodeKey::as_str))
                .with_delete_timeout(step.timeouts.delete);
            session.update(|state| state.insert(record))?;
        }
        (Action::Destroy | Action::Wait(_), Ok(_)) => {
            session.update(|state| state.remove(key))?;
        }
        (Action::Update, Err(_)) if session.record(key).is_some() => {
            session.update(|state| {
                if let Some(r) = state.get_mut(key) {
                    r.transition(RecordStatus::Tainted);
                }
            })?;
        }
        (Action::Destroy, Err(_)) if session.record(key).is_some() => {
            session.update(|state| {
                if let Some(r) = state.get_mut(key) {
                    r.transition(RecordStatus::Failed);
                }
            })?;
        }
        _ => {}
    }
    Ok(())
}

fn report(
    key: NodeKey,
    action: Action,
    status: StepStatus,
    error: Option<NodeError>,
    attempts: u32,
    elapsed: Duration,
) -> StepReport {
    StepReport {
        key,
        action,
        status,
        error,
        attempts,
        elapsed,
    }
}

fn blocked_reports(plan: &Plan) -> impl Iterator<Item = StepReport> + '_ {
    plan.blocked.iter().map(|b| {
        report(
            b.key.clone(),
            b.action,
            StepStatus::Blocked,
            Some(NodeError::Blocked {
                dependency: b.dependency.clone(),
            }),
            0,
            Duration::ZERO,
        )
    })
}

/// Readiness bookkeeping over plan indices
struct Scheduler {
    status: Vec<StepStatus>,
    reports: Vec<Option<StepReport>>,
    /// Unfinished predecessors per step
    waiting: Vec<usize>,
    successors: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
}

impl Scheduler {
    fn new(plan: &Plan) -> Self {
        let index: BTreeMap<&NodeKey, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (&s.key, i))
            .collect();

        let n = plan.steps.len();
        let mut waiting = vec![0; n];
        let mut successors = vec![Vec::new(); n];
        for (i, step) in plan.steps.iter().enumerate() {
            let preds: BTreeSet<usize> = step.after.iter().filter_map(|k| index.get(k).copied()).collect();
            waiting[i] = preds.len();
            for p in preds {
                successors[p].push(i);
            }
        }

        let ready = (0..n).filter(|i| waiting[*i] == 0).collect();
        Self {
            status: vec![StepStatus::Pending; n],
            reports: vec![None; n],
            waiting,
            successors,
            ready,
        }
    }

    /// A step succeeded: dependents whose predecessors are all done become ready
    fn release(&mut self, index: usize) {
        for &succ in &self.successors[index] {
            self.waiting[succ] = self.waiting[succ].saturating_sub(1);
            if self.waiting[succ] == 0 && self.status[succ] == StepStatus::Pending {
                self.ready.insert(succ);
            }
        }
    }

    /// A running step failed an attempt and will try again
    fn retrying(&mut self, index: usize) {
        if matches!(self.status[index], StepStatus::Running | StepStatus::Retrying) {
            self.status[index] = StepStatus::Retrying;
        }
    }

    /// A step failed: every transitive dependent is blocked without an attempt
    fn block_dependents(&mut self, plan: &Plan, index: usize) -> Vec<StepReport> {
        let failed = &plan.steps[index].key;
        let mut blocked = Vec::new();
        let mut stack = self.successors[index].clone();

        while let Some(i) = stack.pop() {
            if self.status[i] != StepStatus::Pending {
                continue;
            }
            self.status[i] = StepStatus::Blocked;
            self.ready.remove(&i);
            let step = &plan.steps[i];
            log::warn!("{}: blocked by failed dependency {failed}", step.key);
            let r = report(
                step.key.clone(),
                step.action,
                StepStatus::Blocked,
                Some(NodeError::Blocked {
                    dependency: failed.clone(),
                }),
                0,
                Duration::ZERO,
            );
            self.reports[i] = Some(r.clone());
            blocked.push(r);
            stack.extend(self.successors[i].iter().copied());
        }
        blocked
    }

    /// Reports in plan order; steps that never started are cancelled
    fn finish(self, plan: &Plan) -> Vec<StepReport> {
        self.reports
            .into_iter()
            .zip(&plan.steps)
            .map(|(r, step)| {
                r.unwrap_or_else(|| {
                    report(
                        step.key.clone(),
                        step.action,
                        StepStatus::Cancelled,
                        Some(NodeError::Cancelled),
                        0,
                        Duration::ZERO,
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::planner::{PlanOptions, plan, plan_destroy};
    use crate::resource::{Node, Timeouts};
    use crate::testing::{FakeAction, FakeCloud, eks_nodes};
    use crate::types::RunStatus;
    use ledger::{MemoryStore, StateStore};
    use std::sync::Mutex;

    fn fast_options(jobs: usize) -> ExecuteOptions {
        ExecuteOptions {
            jobs,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                backoff_factor: 2.0,
                max_delay: Duration::from_secs(10),
            },
            ..ExecuteOptions::default()
        }
    }

    fn registry(cloud: &FakeCloud, action: &FakeAction) -> CollaboratorRegistry {
        CollaboratorRegistry::new()
            .with_fallback(cloud.clone())
            .with_action(action.clone())
    }

    async fn apply(
        nodes: Vec<Node>,
        store: &MemoryStore,
        registry: &CollaboratorRegistry,
        options: ExecuteOptions,
    ) -> ExecutionReport {
        let dag = GraphBuilder::new().nodes(nodes).build().unwrap();
        let mut session = Session::open(store).unwrap();
        let plan = plan(&dag, session.state(), &PlanOptions::default()).unwrap();
        Executor::new(registry)
            .with_options(options)
            .run(&plan, &mut session)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_apply_then_noop_then_destroy() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let report = apply(eks_nodes(), &store, &registry, fast_options(1)).await;
        assert!(report.is_success(), "{report:?}");
        assert_eq!(
            cloud.calls(),
            vec![
                "create vpc",
                "create cluster",
                "create fargate_profile",
                "create oidc_provider",
                "create ingress_controller",
                "create lb_controller",
                "create alb_route",
            ]
        );

        // References were resolved from dependency blobs
        let cluster = cloud.config_of("cluster").unwrap();
        assert_eq!(cluster["vpc_id"], json!("vpc-id"));

        // Re-planning converged state changes nothing
        let dag = GraphBuilder::new().nodes(eks_nodes()).build().unwrap();
        let session = Session::open(&store).unwrap();
        let replan = plan(&dag, session.state(), &PlanOptions::default()).unwrap();
        assert!(!replan.has_changes());
        drop(session);

        // Destroy waits 90s between the route and the controller
        cloud.clear_calls();
        let mut session = Session::open(&store).unwrap();
        let destroy = plan_destroy(session.state(), &PlanOptions::default()).unwrap();
        let started = Instant::now();
        let report = Executor::new(&registry)
            .with_options(fast_options(1))
            .run(&destroy, &mut session)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            cloud.calls(),
            vec![
                "destroy alb_route",
                "destroy lb_controller",
                "destroy ingress_controller",
                "destroy oidc_provider",
                "destroy fargate_profile",
                "destroy cluster",
                "destroy vpc",
            ]
        );
        assert!(cloud.time_of("destroy lb_controller").unwrap() - cloud.time_of("destroy alb_route").unwrap() >= Duration::from_secs(90));
        assert!(started.elapsed() >= Duration::from_secs(90));
        assert!(session.state().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_apply_respects_edges() {
        let cloud = FakeCloud::default().with_latency(Duration::from_secs(5));
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let report = apply(eks_nodes(), &store, &registry, fast_options(4)).await;
        assert!(report.is_success());

        let dag = GraphBuilder::new().nodes(eks_nodes()).build().unwrap();
        for (before, after, _) in dag.edges() {
            if before.as_str() == "lb_barrier" || after.as_str() == "lb_barrier" {
                continue;
            }
            let b = cloud.time_of(&format!("create {before}")).unwrap();
            let a = cloud.time_of(&format!("create {after}")).unwrap();
            assert!(b < a, "{before} should be created before {after}");
        }
        // fargate_profile and oidc_provider ran side by side
        assert_eq!(
            cloud.time_of("create fargate_profile"),
            cloud.time_of("create oidc_provider")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_blocks_dependents_only() {
        let cloud = FakeCloud::default().failing("oidc_provider", CollaboratorError::permanent("access denied"));
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let report = apply(eks_nodes(), &store, &registry, fast_options(2)).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.status_of("oidc_provider"), Some(StepStatus::Failed));
        for key in ["ingress_controller", "lb_controller", "lb_barrier", "alb_route"] {
            assert_eq!(report.status_of(key), Some(StepStatus::Blocked), "{key}");
            assert_eq!(report.step(key).unwrap().attempts, 0);
        }
        for key in ["vpc", "cluster", "fargate_profile"] {
            assert_eq!(report.status_of(key), Some(StepStatus::Succeeded), "{key}");
        }
        assert!(!cloud.calls().contains(&"create lb_controller".to_string()));

        // Nothing recorded for the failed create
        let state = store.load().unwrap();
        assert!(!state.contains("oidc_provider"));
        assert!(state.contains("fargate_profile"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let cloud = FakeCloud::default().flaky("vpc", 2);
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let report = apply(
            vec![Node::managed("vpc", "aws_vpc")],
            &store,
            &registry,
            fast_options(1),
        )
        .await;
        assert!(report.is_success());
        assert_eq!(report.step("vpc").unwrap().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_output_reaches_referencing_nodes() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();
        let nodes = |cidr: &str| {
            vec![
                Node::managed("vpc", "aws_vpc").with_config("cidr", json!(cidr)),
                Node::managed("subnet", "aws_subnet").with_config("vpc_cidr", json!("${vpc.cidr}")),
            ]
        };

        apply(nodes("10.0.0.0/16"), &store, &registry, fast_options(1)).await;
        cloud.clear_calls();

        let report = apply(nodes("10.9.0.0/16"), &store, &registry, fast_options(1)).await;
        assert!(report.is_success(), "{report:?}");
        assert_eq!(cloud.calls(), vec!["update vpc", "update subnet"]);
        assert_eq!(cloud.config_of("subnet").unwrap()["vpc_cidr"], json!("10.9.0.0/16"));

        // Converged again afterwards
        let dag = GraphBuilder::new().nodes(nodes("10.9.0.0/16")).build().unwrap();
        let replan = plan(&dag, &store.load().unwrap(), &PlanOptions::default()).unwrap();
        assert!(!replan.has_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_step_fails_and_blocks_dependents() {
        struct Exploding;

        #[async_trait::async_trait]
        impl ResourceCollaborator for Exploding {
            async fn create(&self, _: &CallContext, _: &Config) -> std::result::Result<Value, CollaboratorError> {
                panic!("collaborator bug");
            }
            async fn update(&self, _: &CallContext, _: &Value, _: &Config) -> std::result::Result<Value, CollaboratorError> {
                panic!("collaborator bug");
            }
            async fn destroy(&self, _: &CallContext, _: &Value) -> std::result::Result<(), CollaboratorError> {
                panic!("collaborator bug");
            }
        }

        let registry = CollaboratorRegistry::new()
            .with_fallback(FakeCloud::default())
            .with_resource("exploding", Exploding);
        let store = MemoryStore::new();
        let report = apply(
            vec![
                Node::managed("broken", "exploding"),
                Node::managed("dependent", "aws_subnet").depends_on("broken"),
                Node::managed("independent", "aws_vpc"),
            ],
            &store,
            &registry,
            fast_options(2),
        )
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.status_of("broken"), Some(StepStatus::Failed));
        assert!(matches!(
            report.step("broken").unwrap().error,
            Some(NodeError::Collaborator { .. })
        ));
        assert_eq!(report.status_of("dependent"), Some(StepStatus::Blocked));
        assert_eq!(report.status_of("independent"), Some(StepStatus::Succeeded));
        assert!(!store.load().unwrap().contains("broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_reported_before_completion() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl ProgressCallback for Recorder {
            fn on_step_retry(&self, key: &NodeKey, attempt: u32, max_attempts: u32, error: &CollaboratorError) {
                assert!(error.is_retryable());
                self.0.lock().unwrap().push(format!("retry {key} {attempt}/{max_attempts}"));
            }
            fn on_step_complete(&self, report: &StepReport) {
                self.0.lock().unwrap().push(format!("{} {}", report.status, report.key));
            }
        }

        let recorder = Arc::new(Recorder::default());
        let registry = CollaboratorRegistry::new().with_fallback(FakeCloud::default().flaky("vpc", 2));
        let store = MemoryStore::new();
        let dag = GraphBuilder::new().node(Node::managed("vpc", "aws_vpc")).build().unwrap();
        let mut session = Session::open(&store).unwrap();
        let planned = plan(&dag, session.state(), &PlanOptions::default()).unwrap();
        Executor::new(&registry)
            .with_options(fast_options(1))
            .with_progress(recorder.clone())
            .run(&planned, &mut session)
            .await
            .unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["retry vpc 1/3", "retry vpc 2/3", "succeeded vpc"]
        );
    }

    #[test]
    fn test_scheduler_tracks_retrying_steps() {
        let dag = GraphBuilder::new()
            .node(Node::managed("a", "null"))
            .node(Node::managed("b", "null").depends_on("a"))
            .build()
            .unwrap();
        let planned = plan(&dag, &ledger::State::new(), &PlanOptions::default()).unwrap();
        let mut run = Scheduler::new(&planned);

        // Only a started step can be retrying
        run.retrying(1);
        assert_eq!(run.status[1], StepStatus::Pending);

        let a = run.ready.pop_first().unwrap();
        run.status[a] = StepStatus::Running;
        run.retrying(a);
        assert_eq!(run.status[a], StepStatus::Retrying);
        assert!(!run.status[a].is_terminal());

        let blocked = run.block_dependents(&planned, a);
        assert_eq!(blocked.len(), 1);
        assert_eq!(run.status[1], StepStatus::Blocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_imperative_timeout_scenario() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default().hanging();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let nodes = vec![
            Node::managed("cluster", "aws_eks_cluster"),
            Node::action("patch_coredns")
                .with_config("command", json!("kubectl patch deployment coredns"))
                .with_timeouts(Timeouts {
                    create: Some(Duration::from_secs(300)),
                    ..Timeouts::default()
                })
                .depends_on("cluster"),
            Node::managed("coredns_addon", "aws_eks_addon").depends_on("patch_coredns"),
            Node::managed("logs", "aws_cloudwatch_log_group"),
        ];

        let started = Instant::now();
        let report = apply(nodes, &store, &registry, fast_options(2)).await;

        assert_eq!(report.status, RunStatus::Failed);
        let patch = report.step("patch_coredns").unwrap();
        assert_eq!(patch.status, StepStatus::Failed);
        assert_eq!(
            patch.error,
            Some(NodeError::Timeout {
                after: Duration::from_secs(300)
            })
        );
        assert_eq!(patch.attempts, 1);
        assert_eq!(report.status_of("coredns_addon"), Some(StepStatus::Blocked));
        assert_eq!(report.status_of("cluster"), Some(StepStatus::Succeeded));
        assert_eq!(report.status_of("logs"), Some(StepStatus::Succeeded));
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(action.was_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_fails_without_retry() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default().exiting(2);
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let report = apply(vec![Node::action("restart")], &store, &registry, fast_options(1)).await;
        let step = report.step("restart").unwrap();
        assert_eq!(step.error, Some(NodeError::ExitStatus { code: 2 }));
        assert_eq!(action.runs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_taints_record() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        apply(vec![Node::managed("vpc", "aws_vpc")], &store, &registry, fast_options(1)).await;

        let failing = FakeCloud::default().failing("vpc", CollaboratorError::permanent("conflict"));
        let registry = CollaboratorRegistry::new().with_fallback(failing);
        let changed = Node::managed("vpc", "aws_vpc").with_config("cidr", json!("10.1.0.0/16"));
        let report = apply(vec![changed.clone()], &store, &registry, fast_options(1)).await;
        assert_eq!(report.status_of("vpc"), Some(StepStatus::Failed));
        assert_eq!(store.load().unwrap().get("vpc").unwrap().status, RecordStatus::Tainted);

        // A tainted record is retried as an update even with the same config
        let registry = CollaboratorRegistry::new().with_fallback(FakeCloud::default());
        let report = apply(vec![changed], &store, &registry, fast_options(1)).await;
        assert_eq!(report.step("vpc").unwrap().action, Action::Update);
        assert!(store.load().unwrap().get("vpc").unwrap().status.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_reference_fails_step() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let report = apply(
            vec![
                Node::managed("vpc", "aws_vpc"),
                Node::managed("subnet", "aws_subnet").with_config("vpc", json!("${vpc.no_such_attribute}")),
            ],
            &store,
            &registry,
            fast_options(1),
        )
        .await;
        assert_eq!(
            report.step("subnet").unwrap().error,
            Some(NodeError::UnresolvedReference {
                reference: "vpc.no_such_attribute".into()
            })
        );
        assert!(!cloud.calls().contains(&"create subnet".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_plan_and_missing_collaborator() {
        let store = MemoryStore::new();
        let dag = GraphBuilder::new().nodes(eks_nodes()).build().unwrap();

        let mut session = Session::open(&store).unwrap();
        let planned = plan(&dag, session.state(), &PlanOptions::default()).unwrap();

        let empty = CollaboratorRegistry::new();
        let err = Executor::new(&empty).run(&planned, &mut session).await.unwrap_err();
        assert!(matches!(err, Error::MissingCollaborator { .. }));

        session.commit().unwrap();
        let registry = CollaboratorRegistry::new().with_fallback(FakeCloud::default());
        let err = Executor::new(&registry).run(&planned, &mut session).await.unwrap_err();
        assert!(matches!(err, Error::StalePlan { planned: 0, current: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_touches_nothing() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let options = ExecuteOptions {
            dry_run: true,
            ..fast_options(1)
        };
        let report = apply(eks_nodes(), &store, &registry, options).await;
        assert!(report.is_success());
        assert!(report.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(cloud.calls().is_empty());
        assert_eq!(store.saves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_new_steps() {
        let cloud = FakeCloud::default().with_latency(Duration::from_secs(60));
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        let dag = GraphBuilder::new().nodes(eks_nodes()).build().unwrap();
        let mut session = Session::open(&store).unwrap();
        let planned = plan(&dag, session.state(), &PlanOptions::default()).unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });

        let report = Executor::new(&registry)
            .with_options(fast_options(1))
            .with_cancellation(token)
            .run(&planned, &mut session)
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.status_of("vpc"), Some(StepStatus::Succeeded));
        assert_eq!(report.status_of("cluster"), Some(StepStatus::Cancelled));
        assert_eq!(report.status_of("alb_route"), Some(StepStatus::Cancelled));
        assert!(session.state().contains("vpc"));
        assert!(!session.state().contains("cluster"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_detects_drift_and_vanished() {
        let cloud = FakeCloud::default();
        let action = FakeAction::default();
        let registry = registry(&cloud, &action);
        let store = MemoryStore::new();

        apply(
            vec![Node::managed("vpc", "aws_vpc"), Node::managed("subnet", "aws_subnet")],
            &store,
            &registry,
            fast_options(1),
        )
        .await;

        cloud.mutate("vpc", json!({"id": "vpc-id", "tags": {"edited": "by hand"}}));
        cloud.delete("subnet");

        let mut session = Session::open(&store).unwrap();
        let report = Executor::new(&registry).refresh(&mut session).await.unwrap();
        assert_eq!(report.drifted, vec![NodeKey::from("vpc")]);
        assert_eq!(report.vanished, vec![NodeKey::from("subnet")]);
        assert!(session.state().get("vpc").unwrap().drifted);
        assert!(!session.state().contains("subnet"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_callbacks() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<String>>);
        impl ProgressCallback for Recorder {
            fn on_step_start(&self, step: &PlanStep) {
                self.0.lock().unwrap().push(format!("start {}", step.key));
            }
            fn on_step_complete(&self, report: &StepReport) {
                self.0.lock().unwrap().push(format!("{} {}", report.status, report.key));
            }
        }

        let recorder = Arc::new(Recorder::default());
        let registry = CollaboratorRegistry::new().with_fallback(FakeCloud::default());
        let store = MemoryStore::new();
        let dag = GraphBuilder::new()
            .node(Node::managed("a", "null"))
            .node(Node::managed("b", "null").depends_on("a"))
            .build()
            .unwrap();
        let mut session = Session::open(&store).unwrap();
        let planned = plan(&dag, session.state(), &PlanOptions::default()).unwrap();
        Executor::new(&registry)
            .with_progress(recorder.clone())
            .run(&planned, &mut session)
            .await
            .unwrap();

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["start a", "succeeded a", "start b", "succeeded b"]
        );
    }
}
