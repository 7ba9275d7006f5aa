//! Audit trail for gateway-executed commands.
//!
//! Each invocation owns one entry: written as `started` before the process
//! is spawned and rewritten with its terminal outcome afterwards. Rejected
//! commands get a single `rejected` entry. The log is capped; the oldest
//! entries are dropped first.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Started,
    Succeeded,
    Failed,
    Killed,
    Rejected,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid audit outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub task_id: Option<String>,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub outcome: AuditOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// Rule name and detail for rejections, error text for failures.
    pub detail: Option<String>,
}

/// Terminal data for [`AuditLogger::record_outcome`].
#[derive(Debug, Clone)]
pub struct AuditCompletion {
    pub outcome: AuditOutcome,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub task_id: Option<String>,
    pub outcome: Option<AuditOutcome>,
    /// Keep only the most recent N matches.
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuditDocument {
    pub entries: Vec<AuditEntry>,
}

pub struct AuditLogger {
    store: DocumentStore<AuditDocument>,
    retention: usize,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            store: DocumentStore::new(path),
            retention: retention.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut AuditDocument) -> R,
    ) -> Result<R, GatewayError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let retention = self.retention;
        self.store.update(|doc| {
            let out = f(doc);
            trim(doc, retention);
            Ok::<_, GatewayError>(out)
        })
    }

    /// Append a `started` entry and return its id.
    pub fn record_start(
        &self,
        task_id: Option<&str>,
        command: &[String],
        cwd: Option<PathBuf>,
    ) -> Result<String, GatewayError> {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.map(str::to_string),
            command: command.to_vec(),
            cwd,
            outcome: AuditOutcome::Started,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            exit_code: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            detail: None,
        };
        let id = entry.id.clone();
        self.mutate(|doc| doc.entries.push(entry))?;
        Ok(id)
    }

    /// Rewrite entry `id` with its terminal outcome. Returns false if the
    /// entry was already dropped by retention.
    pub fn record_outcome(&self, id: &str, completion: AuditCompletion) -> Result<bool, GatewayError> {
        let found = self.mutate(|doc| {
            let Some(entry) = doc.entries.iter_mut().rev().find(|e| e.id == id) else {
                return false;
            };
            entry.outcome = completion.outcome;
            entry.finished_at = Some(Utc::now());
            entry.duration_ms = Some(u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX));
            entry.exit_code = completion.exit_code;
            entry.stdout_bytes = completion.stdout_bytes;
            entry.stderr_bytes = completion.stderr_bytes;
            entry.detail = completion.detail;
            true
        })?;
        if !found {
            debug!(id, "audit entry no longer present; outcome not recorded");
        }
        Ok(found)
    }

    pub fn record_rejection(
        &self,
        task_id: Option<&str>,
        command: &[String],
        reason: &str,
    ) -> Result<String, GatewayError> {
        let now = Utc::now();
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.map(str::to_string),
            command: command.to_vec(),
            cwd: None,
            outcome: AuditOutcome::Rejected,
            started_at: now,
            finished_at: Some(now),
            duration_ms: Some(0),
            exit_code: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            detail: Some(reason.to_string()),
        };
        let id = entry.id.clone();
        self.mutate(|doc| doc.entries.push(entry))?;
        Ok(id)
    }

    /// Matching entries, oldest first.
    pub fn entries(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, GatewayError> {
        let mut entries: Vec<AuditEntry> = self
            .store
            .load()?
            .entries
            .into_iter()
            .filter(|e| {
                filter
                    .task_id
                    .as_deref()
                    .is_none_or(|t| e.task_id.as_deref() == Some(t))
            })
            .filter(|e| filter.outcome.is_none_or(|o| e.outcome == o))
            .collect();
        if let Some(limit) = filter.limit
            && entries.len() > limit
        {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Re-apply the retention cap. Returns how many entries were dropped.
    pub fn compact(&self) -> Result<usize, GatewayError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let retention = self.retention;
        self.store.update(|doc| Ok::<_, GatewayError>(trim(doc, retention)))
    }
}

fn trim(doc: &mut AuditDocument, retention: usize) -> usize {
    let excess = doc.entries.len().saturating_sub(retention);
    if excess > 0 {
        doc.entries.drain(..excess);
    }
    excess
}
