//! The per-run driver. Everything here executes inside a spawned task; its
//! only visible effects are store updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::collaborators::{
    AgentSession, CommitDriver, Fixer, PhaseContext, PromptEnricher, PullRequestDriver,
    QualityScorer, ReviewLoop, RunContext, Verifier, VerifyOutcome, WorkspaceProvisioner,
};
use super::run_record::{Checkpoint, PhaseResult, RunRecord, RunStatus, RunStore};
use crate::config::ForemanConfig;
use crate::merge_queue::{EnqueueRequest, MergeQueue};
use crate::plan::{ExecutionPlanManager, PhaseStatus};
use crate::registry::{NewTask, TaskRegistry, TaskStatus};

pub(crate) const NO_SUCCESS_ERROR: &str = "No phases succeeded; no changes to commit";

/// Everything a run talks to besides the stores.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn AgentSession>,
    pub provisioner: Arc<dyn WorkspaceProvisioner>,
    pub verifier: Arc<dyn Verifier>,
    pub fixer: Arc<dyn Fixer>,
    pub scorer: Arc<dyn QualityScorer>,
    pub committer: Arc<dyn CommitDriver>,
    pub pull_requests: Arc<dyn PullRequestDriver>,
    pub reviewer: Arc<dyn ReviewLoop>,
    pub enricher: Arc<dyn PromptEnricher>,
}

/// The stores a run reads and writes.
#[derive(Clone)]
pub struct RunStores {
    pub runs: Arc<RunStore>,
    pub tasks: Arc<TaskRegistry>,
    pub plans: Arc<ExecutionPlanManager>,
    pub queue: Arc<MergeQueue>,
}

impl RunStores {
    pub fn from_config(config: &ForemanConfig) -> Self {
        Self {
            runs: Arc::new(RunStore::new(config.runs_file())),
            tasks: Arc::new(TaskRegistry::new(config.tasks_file())),
            plans: Arc::new(ExecutionPlanManager::new(config.plans_file())),
            queue: Arc::new(MergeQueue::new(
                config.merge_queue_file(),
                config.toml.merge_queue.main_branch.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_fix_iterations: u32,
    pub quality_threshold: f64,
    pub auto_commit: bool,
    pub open_pr: bool,
    pub review_rounds: u32,
    pub base_branch: String,
    pub branch_prefix: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_fix_iterations: 3,
            quality_threshold: 0.7,
            auto_commit: true,
            open_pr: true,
            review_rounds: 2,
            base_branch: "main".to_string(),
            branch_prefix: "foreman/".to_string(),
        }
    }
}

impl RunSettings {
    pub fn from_config(config: &ForemanConfig) -> Self {
        let o = &config.toml.orchestrator;
        Self {
            max_fix_iterations: o.max_fix_iterations,
            quality_threshold: o.quality_threshold,
            auto_commit: o.auto_commit,
            open_pr: o.open_pr,
            review_rounds: o.review_rounds,
            base_branch: o.base_branch.clone(),
            branch_prefix: o.branch_prefix.clone(),
        }
    }
}

/// Per-run switches layered over [`RunSettings`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub no_commit: bool,
    pub no_pr: bool,
    /// Merge queue priority for the resulting PR.
    pub priority: i32,
}

pub(crate) struct RunDriver {
    pub(crate) stores: RunStores,
    pub(crate) collaborators: Collaborators,
    pub(crate) settings: RunSettings,
    pub(crate) tokens: Mutex<HashMap<String, CancellationToken>>,
}

fn phase_prompt(objective: &str, phase_name: &str, index: usize, total: usize) -> String {
    let focus = match phase_name {
        "Analysis" => "Study the codebase and work out what has to change. Do not edit files yet.",
        "Implementation" => "Make the code changes the objective needs.",
        "Testing" => "Add or update tests covering the new behaviour.",
        "Verification" => "Check the whole change for mistakes and clean up anything left over.",
        _ => "Carry out this phase.",
    };
    format!(
        "Objective: {}\n\nPhase {}/{}: {}\n{}",
        objective,
        index + 1,
        total,
        phase_name,
        focus
    )
}

impl RunDriver {
    fn cancel_requested(&self, run_id: &str, token: &CancellationToken) -> Result<bool> {
        Ok(token.is_cancelled() || self.stores.runs.is_cancel_requested(run_id)?)
    }

    /// Record a checkpoint, ignoring failures.
    fn checkpoint(&self, run_id: &str, name: &str, phase_index: Option<usize>) {
        let result = self.stores.runs.update(run_id, |record| {
            record.checkpoints.push(Checkpoint {
                name: name.to_string(),
                phase_index,
                created_at: chrono::Utc::now(),
            })
        });
        if let Err(e) = result {
            warn!(run_id, checkpoint = name, error = %e, "failed to record checkpoint");
        }
    }

    /// Best-effort move of the task to `failed`.
    fn fail_task_quietly(&self, task_id: &str, reason: &str) {
        match self.stores.tasks.get(task_id) {
            Ok(Some(task)) if task.status.can_transition_to(TaskStatus::Failed) => {
                if let Err(e) = self
                    .stores
                    .tasks
                    .transition(task_id, TaskStatus::Failed, Some(reason.to_string()))
                {
                    warn!(task_id, error = %e, "failed to mark task failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "failed to load task"),
        }
    }

    /// Entry point for the spawned task. Never returns an error: every
    /// failure ends up on the run record.
    pub(crate) async fn execute(
        self: Arc<Self>,
        run_id: String,
        options: RunOptions,
        token: CancellationToken,
    ) {
        let outcome = self.drive(&run_id, options, &token).await;
        if let Err(e) = outcome {
            let message = format!("{:#}", e);
            error!(run_id = %run_id, error = %message, "run failed");
            if let Ok(Some(record)) = self.stores.runs.get(&run_id) {
                self.fail_task_quietly(&record.task_id, &message);
            }
            if let Err(store_err) =
                self.stores
                    .runs
                    .set_status(&run_id, RunStatus::Failed, Some(message))
            {
                error!(run_id = %run_id, error = %store_err, "could not record run failure");
            }
        }
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&run_id);
    }

    fn finish(&self, run_id: &str, status: RunStatus, error: Option<String>) -> Result<()> {
        let record = self.stores.runs.set_status(run_id, status, error)?;
        info!(run_id, status = %record.status, "run finished");
        Ok(())
    }

    fn finish_cancelled(&self, record: &RunRecord) -> Result<()> {
        info!(run_id = %record.run_id, "run cancelled at phase boundary");
        self.fail_task_quietly(&record.task_id, "run cancelled");
        self.finish(&record.run_id, RunStatus::Cancelled, None)
    }

    async fn drive(&self, run_id: &str, options: RunOptions, token: &CancellationToken) -> Result<()> {
        let record = self.stores.runs.set_status(run_id, RunStatus::Running, None)?;
        info!(run_id, task_id = %record.task_id, "run started");
        if self.cancel_requested(run_id, token)? {
            return self.finish_cancelled(&record);
        }

        let task_id = record.task_id.clone();
        let branch = format!("{}{}", self.settings.branch_prefix, task_id);
        let base_branch = self.settings.base_branch.clone();

        let workspace = self
            .collaborators
            .provisioner
            .provision(&task_id, &branch, &base_branch)
            .await
            .context("Failed to provision workspace")?;
        self.stores.tasks.create(NewTask {
            id: task_id.clone(),
            objective: record.objective.clone(),
            workspace_path: workspace.clone(),
            branch_name: branch.clone(),
        })?;
        let plan = self.stores.plans.create_plan(&task_id, &record.objective)?;

        let thread_id = self
            .collaborators
            .agent
            .start_thread(&workspace)
            .await
            .context("Failed to start agent thread")?;
        self.stores.tasks.set_thread_id(&task_id, &thread_id)?;

        self.stores.runs.update(run_id, |r| {
            r.branch = Some(branch.clone());
            r.thread_id = Some(thread_id.clone());
            r.phases = plan.phases.iter().map(|p| PhaseResult::pending(&p.name)).collect();
        })?;

        let ctx = RunContext {
            run_id: run_id.to_string(),
            task_id: task_id.clone(),
            objective: record.objective.clone(),
            workspace,
            branch: branch.clone(),
            base_branch,
            thread_id,
        };

        let total = plan.phases.len();
        for (index, phase) in plan.phases.iter().enumerate() {
            if self.cancel_requested(run_id, token)? {
                return self.finish_cancelled(&record);
            }
            let result = self.run_phase(&ctx, index, &phase.name, total).await?;
            let completed = result.status == PhaseStatus::Completed;
            self.stores.runs.update(run_id, |r| {
                if let Some(slot) = r.phases.get_mut(index) {
                    *slot = result;
                }
            })?;
            if completed {
                self.checkpoint(run_id, &format!("phase-{}-{}", index, phase.name), Some(index));
            }
        }

        let record = self
            .stores
            .runs
            .get(run_id)?
            .context("Run record disappeared")?;
        if record.succeeded_phases() == 0 {
            warn!(run_id, "no phase succeeded");
            self.fail_task_quietly(&task_id, NO_SUCCESS_ERROR);
            return self.finish(run_id, RunStatus::Failed, Some(NO_SUCCESS_ERROR.to_string()));
        }
        if self.cancel_requested(run_id, token)? {
            return self.finish_cancelled(&record);
        }

        self.score_and_polish(&ctx, &record.phases).await;

        let commit_hash = if self.settings.auto_commit && !options.no_commit {
            let message = format!("{}\n\nForeman run {}", record.objective, run_id);
            let hash = self
                .collaborators
                .committer
                .commit(&ctx, &message)
                .await
                .context("Commit failed")?;
            self.stores
                .runs
                .update(run_id, |r| r.commit_hash = hash.clone())?;
            hash
        } else {
            None
        };

        if commit_hash.is_some() && self.settings.open_pr && !options.no_pr {
            self.open_pull_request(&ctx, &record.objective, options.priority)
                .await?;
        }

        self.finish(run_id, RunStatus::Completed, None)
    }

    async fn verify(&self, pctx: &PhaseContext<'_>) -> VerifyOutcome {
        match self.collaborators.verifier.verify(pctx).await {
            Ok(outcome) => outcome,
            Err(e) => VerifyOutcome::fail(vec![format!("{:#}", e)]),
        }
    }

    async fn run_phase(
        &self,
        ctx: &RunContext,
        index: usize,
        name: &str,
        total: usize,
    ) -> Result<PhaseResult> {
        let task_id = ctx.task_id.as_str();
        let pctx = PhaseContext {
            run: ctx,
            phase_name: name,
            phase_index: index,
        };
        let mut result = PhaseResult::pending(name);
        result.status = PhaseStatus::InProgress;

        self.stores
            .plans
            .update_phase_status(task_id, index, PhaseStatus::InProgress)?;
        self.stores.runs.update(&ctx.run_id, |r| {
            if let Some(slot) = r.phases.get_mut(index) {
                slot.status = PhaseStatus::InProgress;
            }
        })?;
        self.stores
            .tasks
            .transition(task_id, TaskStatus::Mutating, None)?;
        info!(run_id = %ctx.run_id, task_id, phase = name, "phase started");

        let base_prompt = phase_prompt(&ctx.objective, name, index, total);
        let prompt = match self
            .collaborators
            .enricher
            .enrich(&pctx, base_prompt.clone())
            .await
        {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(task_id, phase = name, error = %format!("{:#}", e), "prompt enrichment failed");
                base_prompt
            }
        };

        if let Err(e) = self.collaborators.agent.run_turn(&ctx.thread_id, &prompt).await {
            return self.fail_phase(ctx, index, result, format!("Agent turn failed: {:#}", e));
        }

        self.stores
            .tasks
            .transition(task_id, TaskStatus::Verifying, None)?;
        let mut outcome = self.verify(&pctx).await;
        while !outcome.passed && result.fix_iterations < self.settings.max_fix_iterations {
            self.stores
                .tasks
                .transition(task_id, TaskStatus::Fixing, None)?;
            result.fix_iterations += 1;
            info!(task_id, phase = name, iteration = result.fix_iterations, "fixing");
            if let Err(e) = self.collaborators.fixer.fix(&pctx, &outcome).await {
                warn!(task_id, phase = name, error = %format!("{:#}", e), "fix attempt failed");
            }
            self.stores
                .tasks
                .transition(task_id, TaskStatus::Verifying, None)?;
            outcome = self.verify(&pctx).await;
        }

        result.verify_passed = outcome.passed;
        if !outcome.passed {
            let reason = format!(
                "Verification failed after {} fix iterations: {}",
                result.fix_iterations,
                outcome.summary()
            );
            return self.fail_phase(ctx, index, result, reason);
        }

        self.stores.tasks.transition(task_id, TaskStatus::Ready, None)?;
        self.stores
            .plans
            .update_phase_status(task_id, index, PhaseStatus::Completed)?;
        result.status = PhaseStatus::Completed;
        info!(task_id, phase = name, fix_iterations = result.fix_iterations, "phase completed");
        Ok(result)
    }

    fn fail_phase(
        &self,
        ctx: &RunContext,
        index: usize,
        mut result: PhaseResult,
        reason: String,
    ) -> Result<PhaseResult> {
        warn!(task_id = %ctx.task_id, phase = %result.name, reason = %reason, "phase failed");
        self.stores
            .tasks
            .transition(&ctx.task_id, TaskStatus::Failed, Some(reason.clone()))?;
        self.stores
            .plans
            .update_phase_status(&ctx.task_id, index, PhaseStatus::Failed)?;
        result.status = PhaseStatus::Failed;
        result.error = Some(reason);
        Ok(result)
    }

    /// Score the run and, below the threshold, spend one extra fix round.
    /// Nothing in here can fail the run.
    async fn score_and_polish(&self, ctx: &RunContext, phases: &[PhaseResult]) {
        let score = match self.collaborators.scorer.score(ctx, phases).await {
            Ok(score) => score.clamp(0.0, 1.0),
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %format!("{:#}", e), "quality scoring failed");
                return;
            }
        };
        if let Err(e) = self
            .stores
            .runs
            .update(&ctx.run_id, |r| r.quality_score = Some(score))
        {
            warn!(run_id = %ctx.run_id, error = %e, "failed to record quality score");
        }
        info!(run_id = %ctx.run_id, score, threshold = self.settings.quality_threshold, "quality scored");
        if score >= self.settings.quality_threshold {
            return;
        }

        let pctx = PhaseContext {
            run: ctx,
            phase_name: "Quality",
            phase_index: phases.len(),
        };
        let failure = VerifyOutcome::fail(vec![format!(
            "Quality score {:.2} is below the threshold {:.2}. Improve the change.",
            score, self.settings.quality_threshold
        )]);
        if let Err(e) = self.collaborators.fixer.fix(&pctx, &failure).await {
            warn!(run_id = %ctx.run_id, error = %format!("{:#}", e), "quality fix round failed");
            return;
        }
        let outcome = self.verify(&pctx).await;
        info!(run_id = %ctx.run_id, passed = outcome.passed, "quality fix round finished");
        self.checkpoint(&ctx.run_id, "quality-fix", None);
    }

    async fn open_pull_request(&self, ctx: &RunContext, objective: &str, priority: i32) -> Result<()> {
        let title = objective.lines().next().unwrap_or(objective).trim();
        let body = format!(
            "Automated change for:\n\n{}\n\n---\nForeman run `{}`, task `{}`",
            objective, ctx.run_id, ctx.task_id
        );
        let pr = match self.collaborators.pull_requests.open(ctx, title, &body).await {
            Ok(pr) => pr,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(run_id = %ctx.run_id, error = %message, "failed to open pull request");
                self.stores
                    .runs
                    .update(&ctx.run_id, |r| r.pr_error = Some(message))?;
                return Ok(());
            }
        };

        let task = self
            .stores
            .tasks
            .get(&ctx.task_id)?
            .context("Task disappeared")?;
        if task.status == TaskStatus::Failed {
            self.stores
                .tasks
                .transition(&ctx.task_id, TaskStatus::Ready, None)?;
        }
        self.stores
            .tasks
            .transition(&ctx.task_id, TaskStatus::PrOpened, None)?;
        self.stores.runs.update(&ctx.run_id, |r| r.pr_url = Some(pr.url.clone()))?;
        self.stores.queue.enqueue(EnqueueRequest {
            task_id: ctx.task_id.clone(),
            branch: ctx.branch.clone(),
            pr_number: pr.number,
            pr_url: Some(pr.url.clone()),
            priority,
        })?;

        if self.settings.review_rounds == 0 {
            return Ok(());
        }
        match self
            .collaborators
            .reviewer
            .review(ctx, &pr, self.settings.review_rounds)
            .await
        {
            Ok(summary) => {
                info!(run_id = %ctx.run_id, rounds = summary.rounds_run, approved = summary.approved, "review finished");
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(run_id = %ctx.run_id, error = %message, "review loop failed");
                self.stores
                    .runs
                    .update(&ctx.run_id, |r| r.review_error = Some(message))?;
            }
        }
        Ok(())
    }
}
