//! Production collaborators: the agent subprocess, git and `gh`, all shell
//! commands routed through the [`CommandGateway`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::collaborators::{
    AgentSession, CommitDriver, Fixer, PhaseContext, PromptEnricher, PullRequest,
    PullRequestDriver, QualityScorer, ReviewLoop, ReviewSummary, RunContext, Verifier,
    VerifyOutcome, WorkspaceProvisioner,
};
use super::run_record::PhaseResult;
use crate::gateway::{CommandGateway, CommandRequest, CommandResult};
use crate::plan::PhaseStatus;
use crate::protocol::AgentClient;

/// Lines of command output kept in a failure summary.
const FAILURE_TAIL_LINES: usize = 30;

/// Word the review prompt asks the agent to answer with when satisfied.
const APPROVAL_MARKER: &str = "APPROVED";

static PR_NUMBER_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"/pull/(\d+)").ok());

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Run a command in `cwd` on behalf of `task_id`, failing on non-zero exit.
async fn run(
    gateway: &CommandGateway,
    cwd: &Path,
    task_id: &str,
    argv: &[&str],
) -> Result<CommandResult> {
    let request = CommandRequest::new(argv.iter().copied(), cwd).for_task(task_id);
    let display = request.display();
    gateway
        .execute(request)
        .await
        .with_context(|| format!("`{}` failed", display))
}

/// [`AgentClient`] that starts and initializes itself on first use, and
/// again whenever the agent process has gone away.
pub struct ManagedAgent {
    client: AgentClient,
    start_lock: AsyncMutex<()>,
}

impl ManagedAgent {
    pub fn new(client: AgentClient) -> Self {
        Self {
            client,
            start_lock: AsyncMutex::new(()),
        }
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    async fn ensure_ready(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.client.is_running() {
            return Ok(());
        }
        self.client.start().await.context("Failed to start agent")?;
        if let Err(e) = self.client.initialize().await {
            // Leave nothing half-initialized behind for the next caller.
            self.client.stop().await;
            return Err(e).context("Failed to initialize agent");
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.client.stop().await;
    }
}

#[async_trait]
impl AgentSession for ManagedAgent {
    async fn start_thread(&self, workspace: &Path) -> Result<String> {
        self.ensure_ready().await?;
        Ok(self.client.start_thread(workspace).await?)
    }

    async fn run_turn(&self, thread_id: &str, prompt: &str) -> Result<Option<String>> {
        self.ensure_ready().await?;
        let outcome = self.client.run_turn(thread_id, prompt).await?;
        if !outcome.is_success() {
            bail!(
                "Turn ended with status '{}': {}",
                outcome.status,
                outcome.error.as_deref().unwrap_or("no error reported")
            );
        }
        Ok(outcome.last_agent_message)
    }
}

/// One `git worktree` per task under the workspaces directory.
pub struct GitWorktreeProvisioner {
    gateway: Arc<CommandGateway>,
    project_dir: PathBuf,
    workspaces_dir: PathBuf,
}

impl GitWorktreeProvisioner {
    pub fn new(gateway: Arc<CommandGateway>, project_dir: PathBuf, workspaces_dir: PathBuf) -> Self {
        Self {
            gateway,
            project_dir,
            workspaces_dir,
        }
    }
}

#[async_trait]
impl WorkspaceProvisioner for GitWorktreeProvisioner {
    async fn provision(&self, task_id: &str, branch: &str, base_branch: &str) -> Result<PathBuf> {
        let path = self.workspaces_dir.join(task_id);
        if path.exists() {
            debug!(task_id, path = %path.display(), "reusing existing workspace");
            return Ok(path);
        }
        tokio::fs::create_dir_all(&self.workspaces_dir)
            .await
            .context("Failed to create workspaces directory")?;
        let path_str = path
            .to_str()
            .context("Workspace path contains invalid UTF-8")?;
        run(
            &self.gateway,
            &self.project_dir,
            task_id,
            &["git", "worktree", "add", "-b", branch, path_str, base_branch],
        )
        .await?;
        info!(task_id, branch, path = %path.display(), "workspace provisioned");
        Ok(path)
    }
}

/// Runs the configured verification commands in the workspace. No commands
/// means every phase passes.
pub struct CommandVerifier {
    gateway: Arc<CommandGateway>,
    commands: Vec<Vec<String>>,
}

impl CommandVerifier {
    pub fn new(gateway: Arc<CommandGateway>, commands: Vec<Vec<String>>) -> Self {
        Self { gateway, commands }
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self, ctx: &PhaseContext<'_>) -> Result<VerifyOutcome> {
        let mut failures = Vec::new();
        for argv in self.commands.iter().filter(|c| !c.is_empty()) {
            let request = CommandRequest::new(argv.iter().cloned(), &ctx.run.workspace)
                .for_task(&ctx.run.task_id)
                .allow_failure();
            let display = request.display();
            let result = self
                .gateway
                .execute(request)
                .await
                .with_context(|| format!("Verification command `{}` could not run", display))?;
            if !result.success() {
                let output = if result.stderr.trim().is_empty() {
                    &result.stdout
                } else {
                    &result.stderr
                };
                failures.push(format!(
                    "`{}` exited with code {}:\n{}",
                    display,
                    result.exit_code,
                    tail(output, FAILURE_TAIL_LINES)
                ));
            }
        }
        Ok(if failures.is_empty() {
            VerifyOutcome::pass()
        } else {
            VerifyOutcome::fail(failures)
        })
    }
}

/// Asks the agent to repair verification failures on the run's thread.
pub struct AgentFixer {
    agent: Arc<dyn AgentSession>,
}

impl AgentFixer {
    pub fn new(agent: Arc<dyn AgentSession>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Fixer for AgentFixer {
    async fn fix(&self, ctx: &PhaseContext<'_>, failure: &VerifyOutcome) -> Result<()> {
        let prompt = format!(
            "Verification failed during the {} phase. Fix the problems below, then stop.\n\n{}",
            ctx.phase_name,
            failure.summary()
        );
        self.agent.run_turn(&ctx.run.thread_id, &prompt).await?;
        Ok(())
    }
}

/// Share of completed phases, docked a little for every fix iteration.
pub struct PhaseRatioScorer;

const FIX_ITERATION_PENALTY: f64 = 0.05;

#[async_trait]
impl QualityScorer for PhaseRatioScorer {
    async fn score(&self, _ctx: &RunContext, phases: &[PhaseResult]) -> Result<f64> {
        if phases.is_empty() {
            return Ok(0.0);
        }
        let completed = phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .count() as f64;
        let fixes: u32 = phases.iter().map(|p| p.fix_iterations).sum();
        let ratio = completed / phases.len() as f64;
        Ok((ratio - f64::from(fixes) * FIX_ITERATION_PENALTY).clamp(0.0, 1.0))
    }
}

/// `git add -A && git commit` in the workspace.
pub struct GitCommitDriver {
    gateway: Arc<CommandGateway>,
}

impl GitCommitDriver {
    pub fn new(gateway: Arc<CommandGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl CommitDriver for GitCommitDriver {
    async fn commit(&self, ctx: &RunContext, message: &str) -> Result<Option<String>> {
        let cwd = &ctx.workspace;
        let task = ctx.task_id.as_str();
        run(&self.gateway, cwd, task, &["git", "add", "-A"]).await?;
        let status = run(&self.gateway, cwd, task, &["git", "status", "--porcelain"]).await?;
        if status.stdout.trim().is_empty() {
            info!(task_id = task, "nothing to commit");
            return Ok(None);
        }
        run(&self.gateway, cwd, task, &["git", "commit", "-m", message]).await?;
        let head = run(&self.gateway, cwd, task, &["git", "rev-parse", "HEAD"]).await?;
        let hash = head.stdout.trim().to_string();
        info!(task_id = task, commit = %hash, "changes committed");
        Ok(Some(hash))
    }
}

/// Pushes the run branch and opens a PR with the `gh` CLI.
pub struct GhPullRequestDriver {
    gateway: Arc<CommandGateway>,
    remote: String,
}

impl GhPullRequestDriver {
    pub fn new(gateway: Arc<CommandGateway>, remote: impl Into<String>) -> Self {
        Self {
            gateway,
            remote: remote.into(),
        }
    }
}

/// PR number from a `.../pull/<n>` URL.
pub fn parse_pr_number(url: &str) -> Option<u64> {
    PR_NUMBER_RE
        .as_ref()?
        .captures(url)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

#[async_trait]
impl PullRequestDriver for GhPullRequestDriver {
    async fn open(&self, ctx: &RunContext, title: &str, body: &str) -> Result<PullRequest> {
        let cwd = &ctx.workspace;
        let task = ctx.task_id.as_str();
        run(
            &self.gateway,
            cwd,
            task,
            &["git", "push", "-u", &self.remote, &ctx.branch],
        )
        .await?;
        let created = run(
            &self.gateway,
            cwd,
            task,
            &[
                "gh", "pr", "create", "--title", title, "--body", body, "--base",
                &ctx.base_branch, "--head", &ctx.branch,
            ],
        )
        .await?;
        let url = created
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .context("gh pr create printed no URL")?
            .to_string();
        let number = parse_pr_number(&url);
        info!(task_id = task, %url, ?number, "pull request opened");
        Ok(PullRequest { url, number })
    }
}

/// Asks the agent to review its own PR until it answers with the approval
/// marker or the round budget runs out. Changes made between rounds are
/// committed and pushed.
pub struct AgentReviewLoop {
    agent: Arc<dyn AgentSession>,
    gateway: Arc<CommandGateway>,
    committer: Arc<dyn CommitDriver>,
    remote: String,
}

impl AgentReviewLoop {
    pub fn new(
        agent: Arc<dyn AgentSession>,
        gateway: Arc<CommandGateway>,
        committer: Arc<dyn CommitDriver>,
        remote: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            gateway,
            committer,
            remote: remote.into(),
        }
    }

    async fn comment(&self, ctx: &RunContext, pr: &PullRequest, body: &str) {
        let result = run(
            &self.gateway,
            &ctx.workspace,
            &ctx.task_id,
            &["gh", "pr", "comment", &pr.url, "--body", body],
        )
        .await;
        if let Err(e) = result {
            warn!(task_id = %ctx.task_id, error = %format!("{:#}", e), "failed to comment on pull request");
        }
    }
}

#[async_trait]
impl ReviewLoop for AgentReviewLoop {
    async fn review(&self, ctx: &RunContext, pr: &PullRequest, max_rounds: u32) -> Result<ReviewSummary> {
        let mut rounds_run = 0;
        for round in 1..=max_rounds {
            rounds_run = round;
            let prompt = format!(
                "Review the changes on branch {} (pull request {}) against {}. \
                 If they are ready to merge, reply with the single word {}. \
                 Otherwise fix what you find.",
                ctx.branch, pr.url, ctx.base_branch, APPROVAL_MARKER
            );
            let reply = self.agent.run_turn(&ctx.thread_id, &prompt).await?;
            if reply.as_deref().is_some_and(|r| r.contains(APPROVAL_MARKER)) {
                self.comment(ctx, pr, &format!("Review round {}: approved", round))
                    .await;
                return Ok(ReviewSummary {
                    rounds_run,
                    approved: true,
                });
            }
            let message = format!("Address review round {}", round);
            if self.committer.commit(ctx, &message).await?.is_some() {
                run(
                    &self.gateway,
                    &ctx.workspace,
                    &ctx.task_id,
                    &["git", "push", &self.remote, &ctx.branch],
                )
                .await?;
                self.comment(ctx, pr, &format!("Review round {}: changes pushed", round))
                    .await;
            }
        }
        Ok(ReviewSummary {
            rounds_run,
            approved: false,
        })
    }
}

/// Leaves prompts untouched.
pub struct PassthroughEnricher;

#[async_trait]
impl PromptEnricher for PassthroughEnricher {
    async fn enrich(&self, _ctx: &PhaseContext<'_>, prompt: String) -> Result<String> {
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{AuditLogger, GatewaySettings, PolicyStore};
    use tempfile::{TempDir, tempdir};

    fn gateway(dir: &TempDir, allow: &[&str]) -> Arc<CommandGateway> {
        let settings = GatewaySettings {
            allowlist: allow.iter().map(|s| s.to_string()).collect(),
            ..GatewaySettings::default()
        };
        Arc::new(CommandGateway::new(
            settings,
            PolicyStore::new(dir.path().join("policies.json")),
            AuditLogger::new(dir.path().join("audit.json"), 100),
        ))
    }

    fn run_ctx(workspace: &Path) -> RunContext {
        RunContext {
            run_id: "run-1".into(),
            task_id: "task-1".into(),
            objective: "add a feature".into(),
            workspace: workspace.to_path_buf(),
            branch: "foreman/task-1".into(),
            base_branch: "main".into(),
            thread_id: "thr-1".into(),
        }
    }

    #[test]
    fn pr_number_is_parsed_from_url() {
        assert_eq!(
            parse_pr_number("https://github.com/acme/widgets/pull/42"),
            Some(42)
        );
        assert_eq!(parse_pr_number("https://github.com/acme/widgets"), None);
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail("a", 5), "a");
    }

    #[tokio::test]
    async fn verifier_without_commands_passes() {
        let dir = tempdir().unwrap();
        let verifier = CommandVerifier::new(gateway(&dir, &["true"]), vec![]);
        let ctx = run_ctx(dir.path());
        let phase = PhaseContext {
            run: &ctx,
            phase_name: "Testing",
            phase_index: 2,
        };
        assert!(verifier.verify(&phase).await.unwrap().passed);
    }

    #[tokio::test]
    async fn verifier_collects_failures() {
        let dir = tempdir().unwrap();
        let verifier = CommandVerifier::new(
            gateway(&dir, &["true", "sh"]),
            vec![
                vec!["true".into()],
                vec!["sh".into(), "-c".into(), "echo broken >&2; exit 3".into()],
            ],
        );
        let ctx = run_ctx(dir.path());
        let phase = PhaseContext {
            run: &ctx,
            phase_name: "Testing",
            phase_index: 2,
        };
        let outcome = verifier.verify(&phase).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].contains("code 3"));
        assert!(outcome.failures[0].contains("broken"));
    }

    #[tokio::test]
    async fn verifier_rejected_command_is_an_error() {
        let dir = tempdir().unwrap();
        let verifier =
            CommandVerifier::new(gateway(&dir, &["true"]), vec![vec!["curl".into()]]);
        let ctx = run_ctx(dir.path());
        let phase = PhaseContext {
            run: &ctx,
            phase_name: "Testing",
            phase_index: 2,
        };
        assert!(verifier.verify(&phase).await.is_err());
    }

    #[tokio::test]
    async fn scorer_rewards_completed_phases_and_docks_fixes() {
        let dir = tempdir().unwrap();
        let ctx = run_ctx(dir.path());
        let mut phases: Vec<PhaseResult> = ["A", "B", "C", "D"]
            .iter()
            .map(|n| PhaseResult::pending(n))
            .collect();
        for p in &mut phases {
            p.status = PhaseStatus::Completed;
        }
        assert_eq!(PhaseRatioScorer.score(&ctx, &phases).await.unwrap(), 1.0);

        phases[3].status = PhaseStatus::Failed;
        phases[0].fix_iterations = 2;
        let score = PhaseRatioScorer.score(&ctx, &phases).await.unwrap();
        assert!((score - 0.65).abs() < 1e-9);
        assert_eq!(PhaseRatioScorer.score(&ctx, &[]).await.unwrap(), 0.0);
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.email", "dev@example.com"]);
        git(dir, &["config", "user.name", "Dev"]);
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    #[tokio::test]
    async fn commit_driver_commits_changes_and_skips_clean_tree() {
        let state = tempdir().unwrap();
        let repo = tempdir().unwrap();
        init_repo(repo.path());
        let driver = GitCommitDriver::new(gateway(&state, &["git"]));
        let ctx = run_ctx(repo.path());

        assert_eq!(driver.commit(&ctx, "nothing").await.unwrap(), None);

        std::fs::write(repo.path().join("new.txt"), "content\n").unwrap();
        let hash = driver.commit(&ctx, "add new.txt").await.unwrap().unwrap();
        assert_eq!(hash.len(), 40);
        assert_eq!(driver.commit(&ctx, "again").await.unwrap(), None);
    }

    #[tokio::test]
    async fn worktree_provisioner_creates_and_reuses_workspace() {
        let state = tempdir().unwrap();
        let repo = tempdir().unwrap();
        init_repo(repo.path());
        let workspaces = state.path().join("workspaces");
        let provisioner = GitWorktreeProvisioner::new(
            gateway(&state, &["git"]),
            repo.path().to_path_buf(),
            workspaces.clone(),
        );

        let path = provisioner
            .provision("task-1", "foreman/task-1", "main")
            .await
            .unwrap();
        assert_eq!(path, workspaces.join("task-1"));
        assert!(path.join("README.md").exists());

        let again = provisioner
            .provision("task-1", "foreman/task-1", "main")
            .await
            .unwrap();
        assert_eq!(again, path);
    }

    /// Answers the handshake, one thread and one turn, then exits as if it
    /// had crashed.
    const ONE_TURN_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"id":%s,"result":{}}\n' "$id" ;;
    *'"method":"thread/start"'*)
      printf '{"id":%s,"result":{"thread":{"id":"thr-1"}}}\n' "$id" ;;
    *'"method":"turn/start"'*)
      printf '{"id":%s,"result":{"turn":{"id":"turn-1"}}}\n' "$id"
      printf '{"method":"item/completed","params":{"threadId":"thr-1","item":{"type":"agentMessage","text":"done"}}}\n'
      printf '{"method":"turn/completed","params":{"threadId":"thr-1","turn":{"id":"turn-1","status":"completed"}}}\n'
      exit 0 ;;
  esac
done
"#;

    #[tokio::test]
    async fn managed_agent_restarts_after_process_exit() {
        let agent = ManagedAgent::new(AgentClient::new(crate::protocol::ClientOptions {
            command: "sh".into(),
            args: vec!["-c".into(), ONE_TURN_AGENT.into()],
            request_timeout: std::time::Duration::from_secs(5),
            turn_timeout: std::time::Duration::from_secs(5),
            shutdown_grace: std::time::Duration::from_secs(1),
            ..crate::protocol::ClientOptions::default()
        }));
        let dir = tempdir().unwrap();

        let thread = agent.start_thread(dir.path()).await.unwrap();
        assert_eq!(thread, "thr-1");
        let reply = agent.run_turn(&thread, "first").await.unwrap();
        assert_eq!(reply.as_deref(), Some("done"));

        // The fake agent exits after its turn.
        for _ in 0..100 {
            if !agent.client().is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(!agent.client().is_running());

        let thread = agent.start_thread(dir.path()).await.unwrap();
        let reply = agent.run_turn(&thread, "second").await.unwrap();
        assert_eq!(reply.as_deref(), Some("done"));
        agent.shutdown().await;
    }
}
