//! Autonomous runs: objective in, phased agent work, commit and PR out.
//!
//! [`AutonomousOrchestrator::start_run`] returns as soon as the run record is
//! written; the run itself executes on a spawned task and is observed by
//! polling its [`RunRecord`]. Cancellation is cooperative and only takes
//! effect between phases.

pub mod collaborators;
pub mod defaults;
pub mod run_record;
mod runner;

pub use collaborators::{
    AgentSession, CommitDriver, Fixer, PhaseContext, PromptEnricher, PullRequest,
    PullRequestDriver, QualityScorer, ReviewLoop, ReviewSummary, RunContext, Verifier,
    VerifyOutcome, WorkspaceProvisioner,
};
pub use run_record::{Checkpoint, PhaseResult, RunRecord, RunStatus, RunStore};
pub use runner::{Collaborators, RunOptions, RunSettings, RunStores};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::ForemanConfig;
use crate::errors::RunError;
use crate::gateway::CommandGateway;
use crate::protocol::{AgentClient, ClientOptions};
use defaults::{
    AgentFixer, AgentReviewLoop, CommandVerifier, GhPullRequestDriver, GitCommitDriver,
    GitWorktreeProvisioner, ManagedAgent, PassthroughEnricher, PhaseRatioScorer,
};
use runner::RunDriver;

impl Collaborators {
    /// Production wiring: the configured agent command, git worktrees, the
    /// `[verify]` commands, and `gh` for pull requests.
    pub fn from_config(config: &ForemanConfig, gateway: Arc<CommandGateway>) -> (Self, Arc<ManagedAgent>) {
        let agent = Arc::new(ManagedAgent::new(AgentClient::new(ClientOptions::from_config(
            config,
        ))));
        let session: Arc<dyn AgentSession> = agent.clone();
        let remote = config.toml.merge_queue.remote.clone();
        let committer: Arc<dyn CommitDriver> = Arc::new(GitCommitDriver::new(gateway.clone()));
        let collaborators = Self {
            agent: session.clone(),
            provisioner: Arc::new(GitWorktreeProvisioner::new(
                gateway.clone(),
                config.project_dir.clone(),
                config.workspaces_dir(),
            )),
            verifier: Arc::new(CommandVerifier::new(
                gateway.clone(),
                config.toml.verify.commands.clone(),
            )),
            fixer: Arc::new(AgentFixer::new(session.clone())),
            scorer: Arc::new(PhaseRatioScorer),
            committer: committer.clone(),
            pull_requests: Arc::new(GhPullRequestDriver::new(gateway.clone(), remote.clone())),
            reviewer: Arc::new(AgentReviewLoop::new(session, gateway, committer, remote)),
            enricher: Arc::new(PassthroughEnricher),
        };
        (collaborators, agent)
    }
}

pub struct AutonomousOrchestrator {
    driver: Arc<RunDriver>,
}

impl AutonomousOrchestrator {
    pub fn new(stores: RunStores, collaborators: Collaborators, settings: RunSettings) -> Self {
        Self {
            driver: Arc::new(RunDriver {
                stores,
                collaborators,
                settings,
                tokens: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn stores(&self) -> &RunStores {
        &self.driver.stores
    }

    /// Record a queued run and spawn it. Must be called inside a tokio
    /// runtime.
    pub fn start_run(&self, objective: &str, options: RunOptions) -> Result<RunRecord, RunError> {
        let id = Uuid::new_v4().simple().to_string();
        let run_id = format!("run-{}", &id[..12]);
        let task_id = format!("task-{}", &id[..8]);
        let record = self
            .driver
            .stores
            .runs
            .insert(RunRecord::new(&run_id, task_id, objective))?;

        let token = CancellationToken::new();
        self.driver
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(run_id.clone(), token.clone());

        info!(run_id = %run_id, task_id = %record.task_id, "run queued");
        let driver = self.driver.clone();
        tokio::spawn(driver.execute(run_id, options, token));
        Ok(record)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, RunError> {
        self.driver.stores.runs.get(run_id)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, RunError> {
        self.driver.stores.runs.list()
    }

    /// Ask a run to stop at its next phase boundary.
    pub fn cancel_run(&self, run_id: &str) -> Result<RunRecord, RunError> {
        let record = self.driver.stores.runs.request_cancel(run_id)?;
        if let Some(token) = self
            .driver
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(run_id)
        {
            token.cancel();
        }
        info!(run_id, "cancellation requested");
        Ok(record)
    }

    /// Poll the run record until it is terminal.
    pub async fn wait_for_terminal(
        &self,
        run_id: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<RunRecord, RunError> {
        wait_for_terminal(&self.driver.stores.runs, run_id, poll, timeout).await
    }
}

/// Poll `runs` until `run_id` is terminal or `timeout` passes.
pub async fn wait_for_terminal(
    runs: &RunStore,
    run_id: &str,
    poll: Duration,
    timeout: Duration,
) -> Result<RunRecord, RunError> {
    let poll_loop = async {
        loop {
            let record = runs.get(run_id)?.ok_or_else(|| RunError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll).await;
        }
    };
    tokio::time::timeout(timeout, poll_loop)
        .await
        .map_err(|_| RunError::WaitTimedOut {
            run_id: run_id.to_string(),
            after: timeout,
        })?
}
