//! Merge queue: orders PRs that are ready to land.
//!
//! One live entry per task. Entries sort by priority (highest first), then
//! by when they were first enqueued. `dequeue` hands out one entry at a time
//! and is not safe for concurrent consumers; callers serialize externally.

pub mod git;

pub use git::{ConflictReport, Freshness, GitRepo, RebaseOutcome};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::MergeQueueError;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Waiting,
    Ready,
    Rebasing,
    Blocked,
    Merging,
    Merged,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Rebasing => "rebasing",
            Self::Blocked => "blocked",
            Self::Merging => "merging",
            Self::Merged => "merged",
        }
    }

    fn is_dequeueable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Ready)
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "ready" => Ok(Self::Ready),
            "rebasing" => Ok(Self::Rebasing),
            "blocked" => Ok(Self::Blocked),
            "merging" => Ok(Self::Merging),
            "merged" => Ok(Self::Merged),
            _ => Err(format!("Invalid merge status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeQueueEntry {
    pub task_id: String,
    pub branch: String,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub priority: i32,
    pub status: MergeStatus,
    pub conflict_detected: bool,
    #[serde(default)]
    pub conflict_files: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub task_id: String,
    pub branch: String,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub priority: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MergeQueueDocument {
    pub entries: Vec<MergeQueueEntry>,
}

impl MergeQueueDocument {
    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
    }

    fn entry_mut(&mut self, task_id: &str) -> Result<&mut MergeQueueEntry, MergeQueueError> {
        self.entries
            .iter_mut()
            .find(|e| e.task_id == task_id)
            .ok_or_else(|| MergeQueueError::EntryNotFound {
                task_id: task_id.to_string(),
            })
    }
}

/// Counts from [`MergeQueue::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub checked: usize,
    pub ready: usize,
    pub stale: usize,
    pub blocked: usize,
    pub errors: usize,
}

pub struct MergeQueue {
    store: DocumentStore<MergeQueueDocument>,
    main_branch: String,
    write_lock: Mutex<()>,
}

impl MergeQueue {
    pub fn new(path: impl Into<PathBuf>, main_branch: impl Into<String>) -> Self {
        Self {
            store: DocumentStore::new(path),
            main_branch: main_branch.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut MergeQueueDocument) -> Result<R, MergeQueueError>,
    ) -> Result<R, MergeQueueError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.store.update(f)
    }

    /// Insert a task's entry, or update it in place if one exists. An
    /// updated entry keeps its original enqueue time and goes back to
    /// `waiting`.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<MergeQueueEntry, MergeQueueError> {
        let entry = self.mutate(|doc| {
            let now = Utc::now();
            match doc.entries.iter_mut().find(|e| e.task_id == request.task_id) {
                Some(existing) => {
                    existing.branch = request.branch;
                    existing.pr_number = request.pr_number.or(existing.pr_number);
                    existing.pr_url = request.pr_url.or(existing.pr_url.take());
                    existing.priority = request.priority;
                    existing.status = MergeStatus::Waiting;
                    existing.conflict_detected = false;
                    existing.conflict_files.clear();
                    existing.last_error = None;
                    existing.updated_at = now;
                }
                None => doc.entries.push(MergeQueueEntry {
                    task_id: request.task_id.clone(),
                    branch: request.branch,
                    pr_number: request.pr_number,
                    pr_url: request.pr_url,
                    priority: request.priority,
                    status: MergeStatus::Waiting,
                    conflict_detected: false,
                    conflict_files: Vec::new(),
                    enqueued_at: now,
                    updated_at: now,
                    last_error: None,
                }),
            }
            doc.sort();
            let entry = doc.entry_mut(&request.task_id)?.clone();
            Ok(entry)
        })?;
        info!(task_id = %entry.task_id, priority = entry.priority, "enqueued for merge");
        Ok(entry)
    }

    /// Take the first waiting or ready entry and mark it `merging`.
    pub fn dequeue(&self) -> Result<Option<MergeQueueEntry>, MergeQueueError> {
        self.mutate(|doc| {
            doc.sort();
            let Some(entry) = doc
                .entries
                .iter_mut()
                .find(|e| e.status.is_dequeueable())
            else {
                return Ok(None);
            };
            entry.status = MergeStatus::Merging;
            entry.updated_at = Utc::now();
            debug!(task_id = %entry.task_id, "dequeued for merge");
            Ok(Some(entry.clone()))
        })
    }

    pub fn get(&self, task_id: &str) -> Result<Option<MergeQueueEntry>, MergeQueueError> {
        Ok(self
            .store
            .load()?
            .entries
            .into_iter()
            .find(|e| e.task_id == task_id))
    }

    /// All entries in queue order.
    pub fn list(&self) -> Result<Vec<MergeQueueEntry>, MergeQueueError> {
        let mut doc = self.store.load()?;
        doc.sort();
        Ok(doc.entries)
    }

    fn set_status(
        &self,
        task_id: &str,
        status: MergeStatus,
        error: Option<String>,
    ) -> Result<MergeQueueEntry, MergeQueueError> {
        self.mutate(|doc| {
            let entry = doc.entry_mut(task_id)?;
            entry.status = status;
            entry.last_error = error;
            entry.updated_at = Utc::now();
            Ok(entry.clone())
        })
    }

    pub fn mark_merged(&self, task_id: &str) -> Result<MergeQueueEntry, MergeQueueError> {
        self.set_status(task_id, MergeStatus::Merged, None)
    }

    pub fn mark_blocked(&self, task_id: &str, reason: &str) -> Result<MergeQueueEntry, MergeQueueError> {
        self.set_status(task_id, MergeStatus::Blocked, Some(reason.to_string()))
    }

    pub fn remove(&self, task_id: &str) -> Result<bool, MergeQueueError> {
        self.mutate(|doc| {
            let before = doc.entries.len();
            doc.entries.retain(|e| e.task_id != task_id);
            Ok(doc.entries.len() != before)
        })
    }

    /// 1-based position among entries that have not merged yet.
    pub fn position(&self, task_id: &str) -> Result<Option<usize>, MergeQueueError> {
        Ok(self
            .list()?
            .iter()
            .filter(|e| e.status != MergeStatus::Merged)
            .position(|e| e.task_id == task_id)
            .map(|i| i + 1))
    }

    fn branch_of(&self, task_id: &str) -> Result<String, MergeQueueError> {
        self.get(task_id)?
            .map(|e| e.branch)
            .ok_or_else(|| MergeQueueError::EntryNotFound {
                task_id: task_id.to_string(),
            })
    }

    pub fn check_freshness(&self, task_id: &str, repo: &GitRepo) -> Result<Freshness, MergeQueueError> {
        let branch = self.branch_of(task_id)?;
        repo.check_freshness(&branch, &self.main_branch)
    }

    /// Probe for conflicts with main and record the result on the entry.
    pub fn detect_conflicts(
        &self,
        task_id: &str,
        repo: &GitRepo,
    ) -> Result<ConflictReport, MergeQueueError> {
        let branch = self.branch_of(task_id)?;
        let report = repo.detect_conflicts(&branch, &self.main_branch)?;
        self.mutate(|doc| {
            let entry = doc.entry_mut(task_id)?;
            entry.conflict_detected = report.has_conflicts;
            entry.conflict_files = report.files.clone();
            entry.updated_at = Utc::now();
            Ok(())
        })?;
        Ok(report)
    }

    /// Rebase the task's branch onto main. Success marks the entry `ready`;
    /// a conflict marks it `blocked` with `conflict_detected`.
    pub fn rebase_onto_main(
        &self,
        task_id: &str,
        repo: &GitRepo,
    ) -> Result<RebaseOutcome, MergeQueueError> {
        let branch = self.set_status(task_id, MergeStatus::Rebasing, None)?.branch;

        let outcome = match repo.rebase(&branch, &self.main_branch) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.set_status(task_id, MergeStatus::Blocked, Some(e.to_string()))?;
                return Err(e);
            }
        };

        self.mutate(|doc| {
            let entry = doc.entry_mut(task_id)?;
            match &outcome {
                RebaseOutcome::Rebased { .. } => {
                    entry.status = MergeStatus::Ready;
                    entry.conflict_detected = false;
                    entry.conflict_files.clear();
                    entry.last_error = None;
                }
                RebaseOutcome::Conflicted { files } => {
                    entry.status = MergeStatus::Blocked;
                    entry.conflict_detected = true;
                    entry.conflict_files = files.clone();
                    entry.last_error = Some("rebase conflict".to_string());
                }
            }
            entry.updated_at = Utc::now();
            Ok(())
        })?;
        Ok(outcome)
    }

    /// Re-check every waiting, ready or blocked entry against main:
    /// conflicting entries become `blocked`, fresh clean ones `ready`, and
    /// stale clean ones `waiting`.
    pub fn refresh(&self, repo: &GitRepo) -> Result<RefreshSummary, MergeQueueError> {
        let mut summary = RefreshSummary::default();
        let candidates: Vec<MergeQueueEntry> = self
            .list()?
            .into_iter()
            .filter(|e| {
                matches!(
                    e.status,
                    MergeStatus::Waiting | MergeStatus::Ready | MergeStatus::Blocked
                )
            })
            .collect();

        for entry in candidates {
            summary.checked += 1;
            let probe = repo
                .detect_conflicts(&entry.branch, &self.main_branch)
                .and_then(|report| {
                    repo.check_freshness(&entry.branch, &self.main_branch)
                        .map(|fresh| (report, fresh))
                });
            let (report, freshness) = match probe {
                Ok(probe) => probe,
                Err(e) => {
                    warn!(task_id = %entry.task_id, error = %e, "merge queue refresh probe failed");
                    summary.errors += 1;
                    continue;
                }
            };

            let status = if report.has_conflicts {
                summary.blocked += 1;
                MergeStatus::Blocked
            } else if freshness.fresh {
                summary.ready += 1;
                MergeStatus::Ready
            } else {
                summary.stale += 1;
                MergeStatus::Waiting
            };

            self.mutate(|doc| {
                let e = doc.entry_mut(&entry.task_id)?;
                e.status = status;
                e.conflict_detected = report.has_conflicts;
                e.conflict_files = report.files;
                e.updated_at = Utc::now();
                Ok(())
            })?;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::git::test_support::diverged_repo;
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, MergeQueue) {
        let dir = tempdir().unwrap();
        let queue = MergeQueue::new(dir.path().join("merge-queue.json"), "main");
        (dir, queue)
    }

    fn req(task_id: &str, priority: i32) -> EnqueueRequest {
        EnqueueRequest {
            task_id: task_id.to_string(),
            branch: format!("foreman/{}", task_id),
            pr_number: None,
            pr_url: None,
            priority,
        }
    }

    // =========================================
    // Ordering
    // =========================================

    #[test]
    fn equal_priority_dequeues_in_enqueue_order() {
        let (_dir, queue) = setup();
        queue.enqueue(req("a", 0)).unwrap();
        queue.enqueue(req("b", 0)).unwrap();
        queue.enqueue(req("c", 0)).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queue.dequeue().unwrap())
            .map(|e| e.task_id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn higher_priority_jumps_ahead() {
        let (_dir, queue) = setup();
        queue.enqueue(req("low", 0)).unwrap();
        queue.enqueue(req("high", 10)).unwrap();
        assert_eq!(queue.position("high").unwrap(), Some(1));
        assert_eq!(queue.position("low").unwrap(), Some(2));
        assert_eq!(queue.dequeue().unwrap().unwrap().task_id, "high");
    }

    #[test]
    fn re_enqueue_updates_in_place() {
        let (_dir, queue) = setup();
        let first = queue.enqueue(req("a", 0)).unwrap();
        queue.enqueue(req("b", 0)).unwrap();
        queue.mark_blocked("a", "ci red").unwrap();

        let updated = queue
            .enqueue(EnqueueRequest {
                pr_number: Some(42),
                ..req("a", 0)
            })
            .unwrap();
        assert_eq!(queue.list().unwrap().len(), 2);
        assert_eq!(updated.status, MergeStatus::Waiting);
        assert_eq!(updated.pr_number, Some(42));
        assert_eq!(updated.enqueued_at, first.enqueued_at);
        assert_eq!(updated.last_error, None);
        assert_eq!(queue.position("a").unwrap(), Some(1));
    }

    #[test]
    fn dequeue_marks_merging_and_skips_non_ready() {
        let (_dir, queue) = setup();
        queue.enqueue(req("a", 5)).unwrap();
        queue.enqueue(req("b", 0)).unwrap();
        queue.mark_blocked("a", "conflict").unwrap();

        let next = queue.dequeue().unwrap().unwrap();
        assert_eq!(next.task_id, "b");
        assert_eq!(next.status, MergeStatus::Merging);
        assert_eq!(queue.get("b").unwrap().unwrap().status, MergeStatus::Merging);
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn merged_and_removed_entries() {
        let (_dir, queue) = setup();
        queue.enqueue(req("a", 0)).unwrap();
        queue.enqueue(req("b", 0)).unwrap();
        queue.mark_merged("a").unwrap();
        assert_eq!(queue.position("a").unwrap(), None);
        assert_eq!(queue.position("b").unwrap(), Some(1));

        assert!(queue.remove("b").unwrap());
        assert!(!queue.remove("b").unwrap());
        assert!(matches!(
            queue.mark_merged("b"),
            Err(MergeQueueError::EntryNotFound { .. })
        ));
    }

    // =========================================
    // Git-backed operations
    // =========================================

    fn enqueue_feature(queue: &MergeQueue) {
        queue
            .enqueue(EnqueueRequest {
                branch: "feature".into(),
                ..req("t-1", 0)
            })
            .unwrap();
    }

    #[test]
    fn rebase_success_marks_ready() {
        let (dir, queue) = setup();
        let repo_dir = dir.path().join("repo");
        let repo = GitRepo::from_repository(diverged_repo(
            &repo_dir,
            ("main.txt", "m\n"),
            ("feat.txt", "f\n"),
        ));
        enqueue_feature(&queue);

        assert!(!queue.check_freshness("t-1", &repo).unwrap().fresh);
        let outcome = queue.rebase_onto_main("t-1", &repo).unwrap();
        assert!(matches!(outcome, RebaseOutcome::Rebased { .. }));
        let entry = queue.get("t-1").unwrap().unwrap();
        assert_eq!(entry.status, MergeStatus::Ready);
        assert!(!entry.conflict_detected);
        assert!(queue.check_freshness("t-1", &repo).unwrap().fresh);
    }

    #[test]
    fn rebase_conflict_marks_blocked() {
        let (dir, queue) = setup();
        let repo_dir = dir.path().join("repo");
        let repo = GitRepo::from_repository(diverged_repo(
            &repo_dir,
            ("shared.txt", "main\n"),
            ("shared.txt", "feature\n"),
        ));
        enqueue_feature(&queue);

        let outcome = queue.rebase_onto_main("t-1", &repo).unwrap();
        assert!(matches!(outcome, RebaseOutcome::Conflicted { .. }));
        let entry = queue.get("t-1").unwrap().unwrap();
        assert_eq!(entry.status, MergeStatus::Blocked);
        assert!(entry.conflict_detected);
        assert_eq!(entry.conflict_files, vec!["shared.txt"]);
    }

    #[test]
    fn detect_conflicts_records_flag_without_status_change() {
        let (dir, queue) = setup();
        let repo_dir = dir.path().join("repo");
        let repo = GitRepo::from_repository(diverged_repo(
            &repo_dir,
            ("main.txt", "m\n"),
            ("feat.txt", "f\n"),
        ));
        enqueue_feature(&queue);

        let report = queue.detect_conflicts("t-1", &repo).unwrap();
        assert!(!report.has_conflicts);
        assert!(report.files.is_empty());
        let entry = queue.get("t-1").unwrap().unwrap();
        assert_eq!(entry.status, MergeStatus::Waiting);
        assert!(!entry.conflict_detected);
    }

    #[test]
    fn refresh_classifies_entries() {
        let (dir, queue) = setup();
        let repo_dir = dir.path().join("repo");
        let repo = GitRepo::from_repository(diverged_repo(
            &repo_dir,
            ("main.txt", "m\n"),
            ("feat.txt", "f\n"),
        ));
        enqueue_feature(&queue);
        queue
            .enqueue(EnqueueRequest {
                branch: "does-not-exist".into(),
                ..req("t-2", 0)
            })
            .unwrap();

        let summary = queue.refresh(&repo).unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.stale, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(queue.get("t-1").unwrap().unwrap().status, MergeStatus::Waiting);
    }
}
