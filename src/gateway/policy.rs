//! Per-task command policies.
//!
//! A policy overlays the global gateway settings for one task: it can widen
//! the allowlist, deny specific binaries or patterns, and tighten or loosen
//! the per-task concurrency ceiling and timeout. It never replaces the
//! global baseline.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::GatewayError;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandPolicy {
    pub task_id: String,
    /// Extra binaries allowed on top of the global allowlist.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl CommandPolicy {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub policies: BTreeMap<String, CommandPolicy>,
}

pub struct PolicyStore {
    store: DocumentStore<PolicyDocument>,
    write_lock: Mutex<()>,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: DocumentStore::new(path),
            write_lock: Mutex::new(()),
        }
    }

    /// Insert or replace the policy for `policy.task_id`.
    pub fn set_policy(&self, mut policy: CommandPolicy) -> Result<CommandPolicy, GatewayError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        policy.updated_at = Utc::now();
        let saved = self.store.update(|doc| {
            doc.policies
                .insert(policy.task_id.clone(), policy.clone());
            Ok::<_, GatewayError>(policy)
        })?;
        info!(task_id = %saved.task_id, "command policy updated");
        Ok(saved)
    }

    pub fn get_policy(&self, task_id: &str) -> Result<Option<CommandPolicy>, GatewayError> {
        Ok(self.store.load()?.policies.remove(task_id))
    }

    /// Returns whether a policy existed.
    pub fn remove_policy(&self, task_id: &str) -> Result<bool, GatewayError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.store
            .update(|doc| Ok::<_, GatewayError>(doc.policies.remove(task_id).is_some()))
    }

    pub fn list(&self) -> Result<Vec<CommandPolicy>, GatewayError> {
        Ok(self.store.load()?.policies.into_values().collect())
    }
}
