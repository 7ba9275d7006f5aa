//! Run records: the only externally visible state of an autonomous run.
//!
//! Status only moves forward (`queued → running → completed | failed`), with
//! `cancelled` reachable from any non-terminal state. Once terminal, a
//! record can no longer be changed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RunError;
use crate::plan::PhaseStatus;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn can_advance_to(&self, to: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Cancelled || to.rank() >= self.rank()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub name: String,
    pub status: PhaseStatus,
    pub fix_iterations: u32,
    pub verify_passed: bool,
    pub error: Option<String>,
}

impl PhaseResult {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: PhaseStatus::Pending,
            fix_iterations: 0,
            verify_passed: false,
            error: None,
        }
    }
}

/// A named, timestamped progress marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    pub phase_index: Option<usize>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub task_id: String,
    pub objective: String,
    pub status: RunStatus,
    pub branch: Option<String>,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub phases: Vec<PhaseResult>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    pub quality_score: Option<f64>,
    pub commit_hash: Option<String>,
    pub pr_url: Option<String>,
    pub pr_error: Option<String>,
    pub review_error: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, objective: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            objective: objective.into(),
            status: RunStatus::Queued,
            branch: None,
            thread_id: None,
            phases: Vec::new(),
            checkpoints: Vec::new(),
            quality_score: None,
            commit_hash: None,
            pr_url: None,
            pr_error: None,
            review_error: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn succeeded_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RunDocument {
    pub runs: BTreeMap<String, RunRecord>,
}

pub struct RunStore {
    store: DocumentStore<RunDocument>,
    write_lock: Mutex<()>,
}

impl RunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: DocumentStore::new(path),
            write_lock: Mutex::new(()),
        }
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut RunDocument) -> Result<R, RunError>,
    ) -> Result<R, RunError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.store.update(f)
    }

    pub fn insert(&self, record: RunRecord) -> Result<RunRecord, RunError> {
        self.mutate(|doc| {
            doc.runs.insert(record.run_id.clone(), record.clone());
            Ok(record)
        })
    }

    pub fn get(&self, run_id: &str) -> Result<Option<RunRecord>, RunError> {
        Ok(self.store.load()?.runs.remove(run_id))
    }

    /// All runs, newest first.
    pub fn list(&self) -> Result<Vec<RunRecord>, RunError> {
        let mut runs: Vec<RunRecord> = self.store.load()?.runs.into_values().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    /// Apply `f` to a non-terminal record.
    pub fn update(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut RunRecord),
    ) -> Result<RunRecord, RunError> {
        self.mutate(|doc| {
            let record = doc
                .runs
                .get_mut(run_id)
                .ok_or_else(|| RunError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            if record.status.is_terminal() {
                return Err(RunError::Terminal {
                    run_id: run_id.to_string(),
                    status: record.status.to_string(),
                });
            }
            f(record);
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
    }

    /// Move a record to `to`. Moving to a terminal status stamps
    /// `finished_at`; `error` is stored when given.
    pub fn set_status(
        &self,
        run_id: &str,
        to: RunStatus,
        error: Option<String>,
    ) -> Result<RunRecord, RunError> {
        self.mutate(|doc| {
            let record = doc
                .runs
                .get_mut(run_id)
                .ok_or_else(|| RunError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            if record.status.is_terminal() {
                return Err(RunError::Terminal {
                    run_id: run_id.to_string(),
                    status: record.status.to_string(),
                });
            }
            if !record.status.can_advance_to(to) {
                return Err(RunError::IllegalStatus {
                    from: record.status.to_string(),
                    to: to.to_string(),
                });
            }
            let now = Utc::now();
            record.status = to;
            if error.is_some() {
                record.error = error;
            }
            if to.is_terminal() {
                record.finished_at = Some(now);
            }
            record.updated_at = now;
            Ok(record.clone())
        })
    }

    /// Flag a run for cooperative cancellation. Already-terminal runs are
    /// returned unchanged.
    pub fn request_cancel(&self, run_id: &str) -> Result<RunRecord, RunError> {
        match self.update(run_id, |record| record.cancel_requested = true) {
            Err(RunError::Terminal { .. }) => self.get(run_id)?.ok_or_else(|| RunError::RunNotFound {
                run_id: run_id.to_string(),
            }),
            other => other,
        }
    }

    pub fn is_cancel_requested(&self, run_id: &str) -> Result<bool, RunError> {
        Ok(self.get(run_id)?.is_some_and(|r| r.cancel_requested))
    }
}
