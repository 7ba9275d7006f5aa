//! Seams between the autonomous driver and the outside world.
//!
//! Every step that talks to the agent, git, or a hosting service goes through
//! one of these traits. Defaults live in [`super::defaults`]; tests substitute
//! in-memory doubles.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use super::run_record::PhaseResult;

/// Identity of a run as seen by collaborators.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub task_id: String,
    pub objective: String,
    pub workspace: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub thread_id: String,
}

/// A run positioned on one phase.
#[derive(Debug, Clone)]
pub struct PhaseContext<'a> {
    pub run: &'a RunContext,
    pub phase_name: &'a str,
    pub phase_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub passed: bool,
    /// Failure summaries, empty on success.
    pub failures: Vec<String>,
}

impl VerifyOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failures: Vec::new(),
        }
    }

    pub fn fail(failures: Vec<String>) -> Self {
        Self {
            passed: false,
            failures,
        }
    }

    pub fn summary(&self) -> String {
        self.failures.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub url: String,
    pub number: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewSummary {
    pub rounds_run: u32,
    pub approved: bool,
}

/// The agent conversation a run drives.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn start_thread(&self, workspace: &Path) -> Result<String>;

    /// Send one turn and wait for it to finish. Returns the agent's final
    /// message, if any.
    async fn run_turn(&self, thread_id: &str, prompt: &str) -> Result<Option<String>>;
}

/// Creates an isolated checkout for a task.
#[async_trait]
pub trait WorkspaceProvisioner: Send + Sync {
    async fn provision(&self, task_id: &str, branch: &str, base_branch: &str) -> Result<PathBuf>;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, ctx: &PhaseContext<'_>) -> Result<VerifyOutcome>;
}

/// Attempts to repair a failed verification.
#[async_trait]
pub trait Fixer: Send + Sync {
    async fn fix(&self, ctx: &PhaseContext<'_>, failure: &VerifyOutcome) -> Result<()>;
}

/// Scores a finished set of phases in `[0, 1]`.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, ctx: &RunContext, phases: &[PhaseResult]) -> Result<f64>;
}

#[async_trait]
pub trait CommitDriver: Send + Sync {
    /// Commit everything in the workspace. `Ok(None)` means there was nothing
    /// to commit.
    async fn commit(&self, ctx: &RunContext, message: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait PullRequestDriver: Send + Sync {
    async fn open(&self, ctx: &RunContext, title: &str, body: &str) -> Result<PullRequest>;
}

#[async_trait]
pub trait ReviewLoop: Send + Sync {
    async fn review(&self, ctx: &RunContext, pr: &PullRequest, max_rounds: u32) -> Result<ReviewSummary>;
}

/// Rewrites a prompt before it is sent, e.g. to add project context.
#[async_trait]
pub trait PromptEnricher: Send + Sync {
    async fn enrich(&self, ctx: &PhaseContext<'_>, prompt: String) -> Result<String>;
}
