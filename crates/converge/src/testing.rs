//! Shared fixtures for unit tests

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::{ActionCollaborator, CallContext, ResourceCollaborator};
use crate::error::CollaboratorError;
use crate::graph::Dag;
use crate::resource::{CREATE_DURATION, Config, DESTROY_DURATION, Node, NodeKey, NodeKind};
use ledger::{State, StateRecord};

/// The cluster scenario: explicit and inferred edges plus a barrier
pub(crate) fn eks_nodes() -> Vec<Node> {
    vec![
        Node::managed("vpc", "aws_vpc").with_config("cidr", json!("10.0.0.0/16")),
        Node::managed("cluster", "aws_eks_cluster").with_config("vpc_id", json!("${vpc.id}")),
        Node::managed("fargate_profile", "aws_eks_fargate_profile")
            .with_config("cluster", json!("${cluster.name}")),
        Node::managed("oidc_provider", "aws_iam_openid_connect_provider")
            .with_config("url", json!("${cluster.oidc_issuer}")),
        Node::managed("ingress_controller", "helm_release")
            .depends_on("fargate_profile")
            .depends_on("oidc_provider"),
        Node::managed("lb_controller", "helm_release")
            .with_config("role", json!("${oidc_provider.arn}")),
        Node::barrier("lb_barrier", Duration::from_secs(90)).depends_on("lb_controller"),
        Node::managed("alb_route", "kubernetes_ingress")
            .depends_on("ingress_controller")
            .depends_on("lb_barrier"),
    ]
}

/// State in which every node of `dag` is applied and healthy
pub(crate) fn healthy_state(dag: &Dag) -> State {
    let mut state = State::new();
    for node in dag.nodes() {
        let blob = if node.kind == NodeKind::TimedBarrier {
            Value::Object(
                node.config
                    .iter()
                    .filter(|(k, _)| matches!(k.as_str(), DESTROY_DURATION | CREATE_DURATION))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )
        } else {
            json!({ "id": format!("{}-id", node.key) })
        };
        state.insert(
            StateRecord::new(node.key.as_str(), node.kind, node.resource_type.clone())
                .with_hash(node.config_hash())
                .with_blob(blob)
                .with_dependencies(node.depends_on.iter().map(NodeKey::as_str)),
        );
    }
    state
}

#[derive(Default)]
struct CloudLog {
    calls: Mutex<Vec<(String, Instant)>>,
    configs: Mutex<BTreeMap<String, Value>>,
    live: Mutex<BTreeMap<String, Value>>,
    flaky: Mutex<BTreeMap<String, u32>>,
}

/// In-memory cloud that records every call
#[derive(Clone, Default)]
pub(crate) struct FakeCloud {
    latency: Duration,
    failing: BTreeMap<String, String>,
    log: Arc<CloudLog>,
}

impl FakeCloud {
    /// Every call takes `latency` of (tokio) time
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Calls for `key` fail with a permanent error
    pub fn failing(mut self, key: &str, error: CollaboratorError) -> Self {
        self.failing.insert(key.to_string(), error.to_string());
        self
    }

    /// The first `failures` calls for `key` fail with a transient error
    pub fn flaky(self, key: &str, failures: u32) -> Self {
        self.log
            .flaky
            .lock()
            .unwrap()
            .insert(key.to_string(), failures);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.log.calls.lock().unwrap().clear();
    }

    /// When `call` (e.g. "create vpc") first started
    pub fn time_of(&self, call: &str) -> Option<Instant> {
        self.log
            .calls
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c == call)
            .map(|(_, at)| *at)
    }

    /// Resolved configuration last sent for `key`
    pub fn config_of(&self, key: &str) -> Option<Value> {
        self.log.configs.lock().unwrap().get(key).cloned()
    }

    /// Change the live object behind the engine's back
    pub fn mutate(&self, key: &str, blob: Value) {
        self.log.live.lock().unwrap().insert(key.to_string(), blob);
    }

    /// Delete the live object behind the engine's back
    pub fn delete(&self, key: &str) {
        self.log.live.lock().unwrap().remove(key);
    }

    async fn call(&self, verb: &str, key: &NodeKey) -> Result<(), CollaboratorError> {
        self.log
            .calls
            .lock()
            .unwrap()
            .push((format!("{verb} {key}"), Instant::now()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(message) = self.failing.get(key.as_str()) {
            return Err(CollaboratorError::permanent(message.clone()));
        }
        let mut flaky = self.log.flaky.lock().unwrap();
        if let Some(remaining) = flaky.get_mut(key.as_str())
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(CollaboratorError::transient("throttled"));
        }
        Ok(())
    }

    fn provision(&self, key: &NodeKey, config: &Config) -> Value {
        let config = Value::Object(config.clone().into_iter().collect());
        let mut blob = json!({
            "id": format!("{key}-id"),
            "name": key.as_str(),
            "arn": format!("arn:fake:{key}"),
            "oidc_issuer": format!("https://oidc.fake/{key}"),
        });
        if let (Some(blob), Value::Object(fields)) = (blob.as_object_mut(), &config) {
            for (k, v) in fields {
                blob.insert(k.clone(), v.clone());
            }
        }
        self.log.configs.lock().unwrap().insert(key.to_string(), config);
        self.log.live.lock().unwrap().insert(key.to_string(), blob.clone());
        blob
    }
}

#[async_trait]
impl ResourceCollaborator for FakeCloud {
    async fn create(&self, ctx: &CallContext, config: &Config) -> Result<Value, CollaboratorError> {
        self.call("create", &ctx.key).await?;
        Ok(self.provision(&ctx.key, config))
    }

    async fn update(&self, ctx: &CallContext, _current: &Value, config: &Config) -> Result<Value, CollaboratorError> {
        self.call("update", &ctx.key).await?;
        Ok(self.provision(&ctx.key, config))
    }

    async fn destroy(&self, ctx: &CallContext, _current: &Value) -> Result<(), CollaboratorError> {
        self.call("destroy", &ctx.key).await?;
        self.log.live.lock().unwrap().remove(ctx.key.as_str());
        Ok(())
    }

    async fn read(&self, ctx: &CallContext, _current: &Value) -> Result<Option<Value>, CollaboratorError> {
        Ok(self.log.live.lock().unwrap().get(ctx.key.as_str()).cloned())
    }
}

#[derive(Default)]
struct ActionLog {
    runs: AtomicU32,
    tokens: Mutex<Vec<CancellationToken>>,
}

/// Imperative action that exits with a fixed status, or never returns
#[derive(Clone, Default)]
pub(crate) struct FakeAction {
    exit_status: i32,
    hang: bool,
    log: Arc<ActionLog>,
}

impl FakeAction {
    pub fn exiting(mut self, code: i32) -> Self {
        self.exit_status = code;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn runs(&self) -> u32 {
        self.log.runs.load(Ordering::SeqCst)
    }

    /// Whether any invocation saw its cancellation token fire
    pub fn was_cancelled(&self) -> bool {
        self.log
            .tokens
            .lock()
            .unwrap()
            .iter()
            .any(CancellationToken::is_cancelled)
    }
}

#[async_trait]
impl ActionCollaborator for FakeAction {
    async fn run(&self, ctx: &CallContext, _config: &Config, _timeout: Duration) -> Result<i32, CollaboratorError> {
        self.log.runs.fetch_add(1, Ordering::SeqCst);
        self.log.tokens.lock().unwrap().push(ctx.cancel.clone());
        if self.hang {
            ctx.cancel.cancelled().await;
            return Err(CollaboratorError::permanent("interrupted"));
        }
        Ok(self.exit_status)
    }
}
