//! The built-in job executors.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{JobExecutor, JobName, JobScheduler};
use crate::config::ForemanConfig;
use crate::gateway::{CommandGateway, CommandRequest};
use crate::merge_queue::{GitRepo, MergeQueue};
use crate::orchestrator::{RunStatus, RunStore, RunStores};
use crate::registry::{TaskRegistry, TaskStatus};

/// Task ids that belong to a queued or running run.
fn active_task_ids(runs: &RunStore) -> Result<HashSet<String>> {
    Ok(runs
        .list()?
        .into_iter()
        .filter(|r| matches!(r.status, RunStatus::Queued | RunStatus::Running))
        .map(|r| r.task_id)
        .collect())
}

/// Re-probes every queued branch against main.
pub struct MergeQueueRefreshJob {
    queue: Arc<MergeQueue>,
    repo_dir: PathBuf,
}

impl MergeQueueRefreshJob {
    pub fn new(queue: Arc<MergeQueue>, repo_dir: PathBuf) -> Self {
        Self { queue, repo_dir }
    }
}

#[async_trait]
impl JobExecutor for MergeQueueRefreshJob {
    async fn run(&self) -> Result<String> {
        let queue = self.queue.clone();
        let repo_dir = self.repo_dir.clone();
        let summary = tokio::task::spawn_blocking(move || {
            let repo = GitRepo::open(&repo_dir)?;
            queue.refresh(&repo)
        })
        .await
        .context("Merge queue refresh panicked")??;
        Ok(format!(
            "checked {}: {} ready, {} stale, {} blocked, {} errors",
            summary.checked, summary.ready, summary.stale, summary.blocked, summary.errors
        ))
    }
}

/// Fails tasks stuck mid-phase with no live run behind them.
pub struct StaleTaskSweepJob {
    tasks: Arc<TaskRegistry>,
    runs: Arc<RunStore>,
    max_age: Duration,
}

impl StaleTaskSweepJob {
    pub fn new(tasks: Arc<TaskRegistry>, runs: Arc<RunStore>, max_age: Duration) -> Self {
        Self {
            tasks,
            runs,
            max_age,
        }
    }
}

#[async_trait]
impl JobExecutor for StaleTaskSweepJob {
    async fn run(&self) -> Result<String> {
        let active = active_task_ids(&self.runs)?;
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut swept = 0;
        for task in self.tasks.list()? {
            let in_flight = matches!(
                task.status,
                TaskStatus::Mutating | TaskStatus::Verifying | TaskStatus::Fixing
            );
            if !in_flight || active.contains(&task.id) || task.updated_at > cutoff {
                continue;
            }
            let reason = format!(
                "Stale: stuck in '{}' since {}",
                task.status,
                task.updated_at.to_rfc3339()
            );
            self.tasks
                .transition(&task.id, TaskStatus::Failed, Some(reason))?;
            info!(task_id = %task.id, "stale task failed");
            swept += 1;
        }
        Ok(format!("failed {} stale tasks", swept))
    }
}

pub struct AuditCompactionJob {
    gateway: Arc<CommandGateway>,
}

impl AuditCompactionJob {
    pub fn new(gateway: Arc<CommandGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl JobExecutor for AuditCompactionJob {
    async fn run(&self) -> Result<String> {
        let dropped = self.gateway.audit().compact()?;
        Ok(format!("dropped {} audit entries", dropped))
    }
}

/// Removes workspaces whose task is gone or already has its PR open.
pub struct WorkspaceCleanupJob {
    gateway: Arc<CommandGateway>,
    tasks: Arc<TaskRegistry>,
    runs: Arc<RunStore>,
    project_dir: PathBuf,
    workspaces_dir: PathBuf,
}

impl WorkspaceCleanupJob {
    pub fn new(
        gateway: Arc<CommandGateway>,
        tasks: Arc<TaskRegistry>,
        runs: Arc<RunStore>,
        project_dir: PathBuf,
        workspaces_dir: PathBuf,
    ) -> Self {
        Self {
            gateway,
            tasks,
            runs,
            project_dir,
            workspaces_dir,
        }
    }

    async fn remove(&self, path: &std::path::Path) -> Result<()> {
        let path_str = path.to_str().context("Workspace path contains invalid UTF-8")?;
        let request = CommandRequest::new(
            ["git", "worktree", "remove", "--force", path_str],
            &self.project_dir,
        )
        .allow_failure();
        let removed = self.gateway.execute(request).await?;
        if !removed.success() && path.exists() {
            debug!(path = %path.display(), "not a worktree, deleting directory");
            tokio::fs::remove_dir_all(path)
                .await
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobExecutor for WorkspaceCleanupJob {
    async fn run(&self) -> Result<String> {
        if !self.workspaces_dir.exists() {
            return Ok("no workspaces".to_string());
        }
        let active = active_task_ids(&self.runs)?;
        let mut entries = tokio::fs::read_dir(&self.workspaces_dir)
            .await
            .context("Failed to list workspaces")?;

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let task_id = entry.file_name().to_string_lossy().to_string();
            if active.contains(&task_id) {
                continue;
            }
            let done = match self.tasks.get(&task_id)? {
                None => true,
                Some(task) => task.status == TaskStatus::PrOpened,
            };
            if !done {
                continue;
            }
            match self.remove(&path).await {
                Ok(()) => {
                    info!(task_id = %task_id, "workspace removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %format!("{:#}", e), "failed to remove workspace")
                }
            }
        }

        let prune = CommandRequest::new(["git", "worktree", "prune"], &self.project_dir).allow_failure();
        if let Err(e) = self.gateway.execute(prune).await {
            warn!(error = %e, "git worktree prune failed");
        }
        Ok(format!("removed {} workspaces", removed))
    }
}

/// Register the four built-in jobs.
pub fn register_defaults(
    scheduler: &JobScheduler,
    config: &ForemanConfig,
    gateway: Arc<CommandGateway>,
    stores: &RunStores,
) {
    scheduler.register(
        JobName::MergeQueueRefresh,
        Arc::new(MergeQueueRefreshJob::new(
            stores.queue.clone(),
            config.project_dir.clone(),
        )),
    );
    scheduler.register(
        JobName::StaleTaskSweep,
        Arc::new(StaleTaskSweepJob::new(
            stores.tasks.clone(),
            stores.runs.clone(),
            Duration::from_secs(config.toml.scheduler.stale_task_secs),
        )),
    );
    scheduler.register(
        JobName::AuditCompaction,
        Arc::new(AuditCompactionJob::new(gateway.clone())),
    );
    scheduler.register(
        JobName::WorkspaceCleanup,
        Arc::new(WorkspaceCleanupJob::new(
            gateway,
            stores.tasks.clone(),
            stores.runs.clone(),
            config.project_dir.clone(),
            config.workspaces_dir(),
        )),
    );
}
