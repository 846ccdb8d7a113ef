//! Core types for persisted resource state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Schema tag written into every state document
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of node a record was produced by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A provisionable object owned by a resource collaborator
    ManagedResource,
    /// A module call, expanded into its members before planning
    ModuleBoundary,
    /// A side-effect step (shell-like invocation)
    ImperativeAction,
    /// A pure time delay
    TimedBarrier,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::ManagedResource => write!(f, "managed_resource"),
            NodeKind::ModuleBoundary => write!(f, "module"),
            NodeKind::ImperativeAction => write!(f, "imperative_action"),
            NodeKind::TimedBarrier => write!(f, "timed_barrier"),
        }
    }
}

/// Last known status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Last operation succeeded
    Healthy,
    /// Last destroy failed; the object still exists
    Failed,
    /// Last update failed part-way; must be retried or destroyed
    Tainted,
}

impl RecordStatus {
    /// Whether dependents may proceed on top of this record
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Healthy => write!(f, "healthy"),
            RecordStatus::Failed => write!(f, "failed"),
            RecordStatus::Tainted => write!(f, "tainted"),
        }
    }
}

/// Persisted state of a single node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Node identity
    pub key: String,
    /// Kind of the node that produced this record
    pub kind: NodeKind,
    /// Resource type used to select the collaborator
    pub resource_type: String,
    /// Hash of the last applied configuration
    pub config_hash: String,
    /// Collaborator-observed state
    #[serde(default)]
    pub blob: Value,
    /// Dependencies of the node in the graph that last applied it
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Delete timeout, needed to destroy the node once it leaves the graph
    #[serde(default)]
    pub delete_timeout: Option<Duration>,
    /// Last known status
    pub status: RecordStatus,
    /// Set when a refresh observed state different from `blob`'s previous value
    #[serde(default)]
    pub drifted: bool,
    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// Create a healthy record
    pub fn new(key: impl Into<String>, kind: NodeKind, resource_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind,
            resource_type: resource_type.into(),
            config_hash: String::new(),
            blob: Value::Null,
            dependencies: BTreeSet::new(),
            delete_timeout: None,
            status: RecordStatus::Healthy,
            drifted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    pub fn with_blob(mut self, blob: Value) -> Self {
        self.blob = blob;
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delete_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Record a status transition
    pub fn transition(&mut self, status: RecordStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// The whole persisted state: one record per node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Schema tag, see [`SCHEMA_VERSION`]
    pub schema: u32,
    /// Incremented on every save
    #[serde(default)]
    pub serial: u64,
    /// Last time the state was saved
    pub updated_at: DateTime<Utc>,
    /// Records keyed by node identity
    #[serde(default)]
    pub records: BTreeMap<String, StateRecord>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schema: SCHEMA_VERSION,
            serial: 0,
            updated_at: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

impl State {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&StateRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut StateRecord> {
        self.records.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    /// Insert or replace a record
    pub fn insert(&mut self, record: StateRecord) {
        self.records.insert(record.key.clone(), record);
    }

    pub fn remove(&mut self, key: &str) -> Option<StateRecord> {
        self.records.remove(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate records in key order
    pub fn iter(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }

    /// Mark a record as tainted so the next plan retries it
    pub fn taint(&mut self, key: &str) -> Result<()> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| Error::UnknownRecord(key.to_string()))?;
        record.transition(RecordStatus::Tainted);
        Ok(())
    }

    /// Clear a taint or failure, trusting the last observed blob again
    pub fn untaint(&mut self, key: &str) -> Result<()> {
        let record = self
            .records
            .get_mut(key)
            .ok_or_else(|| Error::UnknownRecord(key.to_string()))?;
        record.transition(RecordStatus::Healthy);
        record.drifted = false;
        Ok(())
    }

    /// Check structural invariants after loading
    pub fn validate(&self, origin: &Path) -> Result<()> {
        if self.schema != SCHEMA_VERSION {
            return Err(Error::Corrupt {
                path: origin.to_path_buf(),
                message: format!(
                    "unsupported schema version {} (expected {})",
                    self.schema, SCHEMA_VERSION
                ),
            });
        }

        for (key, record) in &self.records {
            if key != &record.key {
                return Err(Error::Corrupt {
                    path: origin.to_path_buf(),
                    message: format!("record stored under {key} claims key {}", record.key),
                });
            }
            if record.dependencies.contains(key) {
                return Err(Error::Corrupt {
                    path: origin.to_path_buf(),
                    message: format!("record {key} depends on itself"),
                });
            }
        }

        Ok(())
    }
}
