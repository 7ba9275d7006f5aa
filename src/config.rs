//! Unified configuration for Foreman.
//!
//! Settings are read from `.foreman/foreman.toml` and layered:
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! command = "codex"
//! args = ["app-server"]
//! request_timeout_secs = 30
//!
//! [gateway]
//! enabled = true
//! allowlist = ["git", "cargo", "gh"]
//! deny_patterns = ["--no-verify"]
//! max_concurrent = 10
//! per_task_max_concurrent = 5
//! timeout_secs = 120
//!
//! [merge_queue]
//! main_branch = "main"
//!
//! [scheduler]
//! tick_secs = 5
//!
//! [scheduler.intervals]
//! merge_queue_refresh = 300
//!
//! [orchestrator]
//! max_fix_iterations = 3
//! quality_threshold = 0.7
//! open_pr = true
//!
//! [verify]
//! commands = [["cargo", "test"]]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".foreman";

/// Minimum interval accepted for a scheduled job.
pub const MIN_JOB_INTERVAL_SECS: u64 = 60;

/// Agent subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Executable for the agent (default: "codex")
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments passed to the agent executable
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Upper bound on a single turn, from `turn/start` to `turn/completed`
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Model hint forwarded in `thread/start`
    #[serde(default)]
    pub model: Option<String>,
}

fn default_agent_args() -> Vec<String> {
    vec!["app-server".to_string()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_turn_timeout_secs() -> u64 {
    1800
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            args: default_agent_args(),
            request_timeout_secs: default_request_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            model: None,
        }
    }
}

/// Command execution gateway settings (the global baseline).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Binaries any task may run
    #[serde(default = "default_allowlist")]
    pub allowlist: Vec<String>,
    /// Extra regexes matched against the joined command string
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_per_task_max_concurrent")]
    pub per_task_max_concurrent: usize,
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
    /// Cap on captured stdout and stderr, each
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Audit entries kept before the oldest are dropped
    #[serde(default = "default_audit_retention")]
    pub audit_retention: usize,
}

fn default_true() -> bool {
    true
}

fn default_allowlist() -> Vec<String> {
    ["git", "gh", "cargo", "npm", "npx", "pnpm", "yarn", "make", "ls", "cat"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_concurrent() -> usize {
    10
}

fn default_per_task_max_concurrent() -> usize {
    5
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_audit_retention() -> usize {
    5000
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: default_allowlist(),
            deny_patterns: Vec::new(),
            max_concurrent: default_max_concurrent(),
            per_task_max_concurrent: default_per_task_max_concurrent(),
            timeout_secs: default_command_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            audit_retention: default_audit_retention(),
        }
    }
}

/// Merge queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueueSection {
    /// Integration branch that queued branches must be fresh against
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    /// Remote that run branches are pushed to before a PR is opened
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_main_branch() -> String {
    "main".to_string()
}

impl Default for MergeQueueSection {
    fn default() -> Self {
        Self {
            main_branch: default_main_branch(),
            remote: default_remote(),
        }
    }
}

/// Job scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// How often the driver checks for due jobs
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Run history kept per job
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Per-job interval overrides in seconds, keyed by job name
    #[serde(default)]
    pub intervals: BTreeMap<String, u64>,
    /// Tasks stuck mid-phase longer than this are failed by the sweep job
    #[serde(default = "default_stale_task_secs")]
    pub stale_task_secs: u64,
}

fn default_tick_secs() -> u64 {
    5
}

fn default_history_limit() -> usize {
    50
}

fn default_stale_task_secs() -> u64 {
    2 * 60 * 60
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            history_limit: default_history_limit(),
            intervals: BTreeMap::new(),
            stale_task_secs: default_stale_task_secs(),
        }
    }
}

/// Autonomous run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,
    /// Runs scoring below this get one extra fix round
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    #[serde(default = "default_true")]
    pub open_pr: bool,
    /// Review rounds after the PR is opened (0 disables review)
    #[serde(default = "default_review_rounds")]
    pub review_rounds: u32,
    /// Branch new workspaces fork from
    #[serde(default = "default_main_branch")]
    pub base_branch: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

fn default_max_fix_iterations() -> u32 {
    3
}

fn default_quality_threshold() -> f64 {
    0.7
}

fn default_review_rounds() -> u32 {
    2
}

fn default_branch_prefix() -> String {
    "foreman/".to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_fix_iterations: default_max_fix_iterations(),
            quality_threshold: default_quality_threshold(),
            auto_commit: true,
            open_pr: true,
            review_rounds: default_review_rounds(),
            base_branch: default_main_branch(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

/// Verification commands run after every phase, each as an argv vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifySection {
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
}

/// The complete foreman.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub merge_queue: MergeQueueSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub verify: VerifySection,
}

impl ForemanToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `foreman.toml` from the state directory, or defaults if absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Agent command, with fallback to environment variable.
    pub fn agent_cmd(&self) -> String {
        std::env::var("FOREMAN_AGENT_CMD")
            .ok()
            .or_else(|| self.agent.command.clone())
            .unwrap_or_else(|| "codex".to_string())
    }

    /// Whether the gateway is enabled; the environment can switch it off.
    pub fn gateway_enabled(&self) -> bool {
        if let Ok(env_val) = std::env::var("FOREMAN_GATEWAY_ENABLED") {
            return env_val != "false" && env_val != "0";
        }
        self.gateway.enabled
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for pattern in &self.gateway.deny_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                warnings.push(format!(
                    "Deny pattern '{}' is not a valid regex and will be ignored: {}",
                    pattern, e
                ));
            }
        }

        if self.gateway.max_concurrent == 0 {
            warnings.push("gateway.max_concurrent is 0: no command can ever run".to_string());
        }
        if self.gateway.per_task_max_concurrent == 0 {
            warnings.push(
                "gateway.per_task_max_concurrent is 0: no task command can ever run".to_string(),
            );
        }

        for (job, secs) in &self.scheduler.intervals {
            if *secs < MIN_JOB_INTERVAL_SECS {
                warnings.push(format!(
                    "Interval for job '{}' is {}s; the minimum is {}s",
                    job, secs, MIN_JOB_INTERVAL_SECS
                ));
            }
            if crate::scheduler::JobName::from_str_opt(job).is_none() {
                warnings.push(format!("Unknown job '{}' in [scheduler.intervals]", job));
            }
        }

        if !(0.0..=1.0).contains(&self.orchestrator.quality_threshold) {
            warnings.push(format!(
                "orchestrator.quality_threshold {} is outside [0, 1]",
                self.orchestrator.quality_threshold
            ));
        }

        for cmd in &self.verify.commands {
            if cmd.is_empty() {
                warnings.push("verify.commands contains an empty command".to_string());
            }
        }

        warnings
    }
}

/// Runtime configuration: the parsed file plus resolved paths and CLI flags.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: ForemanToml,
    pub verbose: bool,
}

impl ForemanConfig {
    /// Create a new ForemanConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let toml = ForemanToml::load_or_default(&state_dir)?;

        Ok(Self {
            project_dir,
            state_dir,
            toml,
            verbose: false,
        })
    }

    /// Create ForemanConfig with CLI overrides.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        std::fs::create_dir_all(self.workspaces_dir())
            .context("Failed to create workspaces directory")?;
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("foreman.toml")
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.state_dir.join("tasks.json")
    }

    pub fn plans_file(&self) -> PathBuf {
        self.state_dir.join("plans.json")
    }

    pub fn runs_file(&self) -> PathBuf {
        self.state_dir.join("runs.json")
    }

    pub fn policies_file(&self) -> PathBuf {
        self.state_dir.join("policies.json")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.state_dir.join("audit.json")
    }

    pub fn merge_queue_file(&self) -> PathBuf {
        self.state_dir.join("merge-queue.json")
    }

    pub fn scheduler_file(&self) -> PathBuf {
        self.state_dir.join("scheduler.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.agent.request_timeout_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let toml = ForemanToml::default();
        assert_eq!(toml.agent.request_timeout_secs, 30);
        assert_eq!(toml.gateway.per_task_max_concurrent, 5);
        assert_eq!(toml.gateway.timeout_secs, 120);
        assert_eq!(toml.merge_queue.main_branch, "main");
        assert_eq!(toml.orchestrator.max_fix_iterations, 3);
        assert!(toml.gateway.allowlist.contains(&"git".to_string()));
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let toml = ForemanToml::parse(
            r#"
[gateway]
max_concurrent = 2

[orchestrator]
open_pr = false

[verify]
commands = [["cargo", "test"], ["cargo", "clippy"]]
"#,
        )
        .unwrap();
        assert_eq!(toml.gateway.max_concurrent, 2);
        assert_eq!(toml.gateway.per_task_max_concurrent, 5);
        assert!(!toml.orchestrator.open_pr);
        assert!(toml.orchestrator.auto_commit);
        assert_eq!(toml.verify.commands.len(), 2);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(ForemanToml::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_validate_flags_bad_regex_and_short_interval() {
        let toml = ForemanToml::parse(
            r#"
[gateway]
deny_patterns = ["(unclosed"]

[scheduler.intervals]
merge_queue_refresh = 10
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("(unclosed")));
        assert!(warnings.iter().any(|w| w.contains("merge_queue_refresh")));
    }

    #[test]
    fn test_validate_unknown_job_and_threshold() {
        let toml = ForemanToml::parse(
            r#"
[scheduler.intervals]
nightly_party = 3600

[orchestrator]
quality_threshold = 1.5
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("nightly_party")));
        assert!(warnings.iter().any(|w| w.contains("quality_threshold")));
    }

    #[test]
    fn test_validate_default_is_clean() {
        assert!(ForemanToml::default().validate().is_empty());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("foreman.toml");
        let mut toml = ForemanToml::default();
        toml.scheduler.intervals.insert("audit_compaction".into(), 7200);
        toml.save(&path).unwrap();
        let loaded = ForemanToml::load(&path).unwrap();
        assert_eq!(loaded.scheduler.intervals.get("audit_compaction"), Some(&7200));
    }

    #[test]
    fn test_agent_cmd_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let mut toml = ForemanToml::default();
        toml.agent.command = Some("from-file".into());
        // SAFETY: serialized by ENV_MUTEX.
        unsafe { std::env::set_var("FOREMAN_AGENT_CMD", "from-env") };
        assert_eq!(toml.agent_cmd(), "from-env");
        unsafe { std::env::remove_var("FOREMAN_AGENT_CMD") };
        assert_eq!(toml.agent_cmd(), "from-file");
    }

    #[test]
    fn test_gateway_enabled_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let toml = ForemanToml::default();
        // SAFETY: serialized by ENV_MUTEX.
        unsafe { std::env::set_var("FOREMAN_GATEWAY_ENABLED", "false") };
        assert!(!toml.gateway_enabled());
        unsafe { std::env::remove_var("FOREMAN_GATEWAY_ENABLED") };
        assert!(toml.gateway_enabled());
    }

    #[test]
    fn test_foreman_config_paths() {
        let dir = tempdir().unwrap();
        let config = ForemanConfig::new(dir.path().to_path_buf()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.state_dir, root.join(".foreman"));
        assert_eq!(config.tasks_file(), root.join(".foreman/tasks.json"));
        assert_eq!(config.merge_queue_file(), root.join(".foreman/merge-queue.json"));
        config.ensure_directories().unwrap();
        assert!(config.log_dir().exists());
        assert!(config.workspaces_dir().exists());
    }

    #[test]
    fn test_foreman_config_reads_file() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        std::fs::write(
            dir.path().join(".foreman/foreman.toml"),
            "[agent]\nrequest_timeout_secs = 7\n",
        )
        .unwrap();
        let config = ForemanConfig::with_cli_args(dir.path().to_path_buf(), true).unwrap();
        assert!(config.verbose);
        assert_eq!(config.request_timeout(), Duration::from_secs(7));
    }
}
