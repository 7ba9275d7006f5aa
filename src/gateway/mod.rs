//! Command execution gateway.
//!
//! Every external command the control plane runs (git, gh, verification
//! commands) goes through [`CommandGateway::execute`]. A call is checked
//! against the policy rules in a fixed order, admitted under the global and
//! per-task concurrency ceilings, audited, and raced against a timeout.
//!
//! Rejections happen before anything is spawned and name the rule that
//! fired. Over-limit calls are rejected, not queued.

pub mod audit;
pub mod policy;
pub mod rules;

pub use audit::{AuditCompletion, AuditEntry, AuditFilter, AuditLogger, AuditOutcome};
pub use policy::{CommandPolicy, PolicyStore};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ForemanConfig;
use crate::errors::GatewayError;

/// Exit code reported for commands killed on timeout (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Global gateway settings, usually taken from `[gateway]` in foreman.toml.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub enabled: bool,
    pub allowlist: Vec<String>,
    pub deny_patterns: Vec<String>,
    pub max_concurrent: usize,
    pub per_task_max_concurrent: usize,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: ["git", "gh", "cargo", "npm", "npx", "pnpm", "yarn", "make", "ls", "cat"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            deny_patterns: Vec::new(),
            max_concurrent: 10,
            per_task_max_concurrent: 5,
            default_timeout: Duration::from_secs(120),
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl GatewaySettings {
    pub fn from_config(config: &ForemanConfig) -> Self {
        let gw = &config.toml.gateway;
        Self {
            enabled: config.toml.gateway_enabled(),
            allowlist: gw.allowlist.clone(),
            deny_patterns: gw.deny_patterns.clone(),
            max_concurrent: gw.max_concurrent,
            per_task_max_concurrent: gw.per_task_max_concurrent,
            default_timeout: Duration::from_secs(gw.timeout_secs),
            max_output_bytes: gw.max_output_bytes,
        }
    }
}

/// One command invocation. The command is an argv vector and is never
/// passed through a shell.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub task_id: Option<String>,
    pub timeout: Option<Duration>,
    /// Return non-zero exits and timeouts as an `Ok` result instead of an error.
    pub allow_failure: bool,
    pub env: Vec<(String, String)>,
}

impl CommandRequest {
    pub fn new<I, S>(command: I, cwd: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            task_id: None,
            timeout: None,
            allow_failure: false,
            env: Vec::new(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration_ms: u64,
    pub killed: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.killed
    }
}

#[derive(Debug, Default)]
struct Counters {
    global: usize,
    per_task: HashMap<String, usize>,
}

fn lock_counters(counters: &Mutex<Counters>) -> MutexGuard<'_, Counters> {
    counters
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Concurrency slot held for the life of one command. Released on drop, so
/// every exit path (success, error, timeout, panic) gives the slot back.
struct Permit {
    counters: Arc<Mutex<Counters>>,
    task_id: Option<String>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut counters = lock_counters(&self.counters);
        counters.global = counters.global.saturating_sub(1);
        if let Some(task_id) = &self.task_id
            && let Some(count) = counters.per_task.get_mut(task_id)
        {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_task.remove(task_id);
            }
        }
    }
}

enum RawOutcome {
    Exited {
        output: std::process::Output,
        duration: Duration,
    },
    TimedOut {
        duration: Duration,
    },
}

pub struct CommandGateway {
    settings: GatewaySettings,
    deny_patterns: Vec<Regex>,
    policies: PolicyStore,
    audit: Arc<AuditLogger>,
    counters: Arc<Mutex<Counters>>,
}

impl CommandGateway {
    pub fn new(settings: GatewaySettings, policies: PolicyStore, audit: AuditLogger) -> Self {
        let deny_patterns = rules::compile_patterns(&settings.deny_patterns);
        Self {
            settings,
            deny_patterns,
            policies,
            audit: Arc::new(audit),
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    pub fn from_config(config: &ForemanConfig) -> Self {
        Self::new(
            GatewaySettings::from_config(config),
            PolicyStore::new(config.policies_file()),
            AuditLogger::new(config.audit_file(), config.toml.gateway.audit_retention),
        )
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn active_count(&self) -> usize {
        lock_counters(&self.counters).global
    }

    pub fn active_for_task(&self, task_id: &str) -> usize {
        lock_counters(&self.counters)
            .per_task
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }

    /// Forget all concurrency counters. Permits still outstanding will
    /// saturate at zero when they drop.
    pub fn reset(&self) {
        let mut counters = lock_counters(&self.counters);
        counters.global = 0;
        counters.per_task.clear();
    }

    /// Check `request` against every rule and, if it passes, reserve a slot.
    fn admit(
        &self,
        request: &CommandRequest,
        policy: Option<&CommandPolicy>,
    ) -> Result<Permit, GatewayError> {
        if !self.settings.enabled {
            return Err(GatewayError::Disabled);
        }

        let program = match request.command.first() {
            Some(p) if !p.trim().is_empty() => p.as_str(),
            _ => return Err(GatewayError::EmptyCommand),
        };
        let binary = rules::binary_name(program);

        let listed = |list: &[String]| list.iter().any(|b| b == binary || b == program);
        let policy_allow = policy.map(|p| p.allow.as_slice()).unwrap_or(&[]);
        if !listed(&self.settings.allowlist) && !listed(policy_allow) {
            return Err(GatewayError::policy(
                "allowlist",
                format!("'{}' is not an allowed binary", binary),
            ));
        }
        if let Some(policy) = policy
            && listed(&policy.deny)
        {
            return Err(GatewayError::policy(
                "task-denylist",
                format!("'{}' is denied for task {}", binary, policy.task_id),
            ));
        }

        let joined = request.display();
        if let Some(name) = rules::match_danger(&joined) {
            return Err(GatewayError::policy("danger-pattern", name));
        }
        if let Some(re) = rules::first_match(&self.deny_patterns, &joined) {
            return Err(GatewayError::policy(
                "deny-pattern",
                format!("matches '{}'", re.as_str()),
            ));
        }
        if let Some(policy) = policy {
            let task_patterns = rules::compile_patterns(&policy.deny_patterns);
            if let Some(re) = rules::first_match(&task_patterns, &joined) {
                return Err(GatewayError::policy(
                    "task-deny-pattern",
                    format!("matches '{}'", re.as_str()),
                ));
            }
        }

        let mut counters = lock_counters(&self.counters);
        if counters.global >= self.settings.max_concurrent {
            return Err(GatewayError::ConcurrencyLimit {
                scope: "global".into(),
                limit: self.settings.max_concurrent,
            });
        }
        if let Some(task_id) = &request.task_id {
            let limit = policy
                .and_then(|p| p.max_concurrent)
                .unwrap_or(self.settings.per_task_max_concurrent);
            let running = counters.per_task.get(task_id).copied().unwrap_or(0);
            if running >= limit {
                return Err(GatewayError::ConcurrencyLimit {
                    scope: format!("task {}", task_id),
                    limit,
                });
            }
            *counters.per_task.entry(task_id.clone()).or_insert(0) += 1;
        }
        counters.global += 1;

        Ok(Permit {
            counters: self.counters.clone(),
            task_id: request.task_id.clone(),
        })
    }

    /// Run one command under policy.
    ///
    /// Non-zero exits and timeouts are errors unless the request set
    /// `allow_failure`, in which case they come back as a result with
    /// `success() == false` (and `killed == true` for timeouts).
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResult, GatewayError> {
        let policy = match &request.task_id {
            Some(task_id) => self.policies.get_policy(task_id)?,
            None => None,
        };

        let _permit = match self.admit(&request, policy.as_ref()) {
            Ok(permit) => permit,
            Err(err) => {
                warn!(command = %request.display(), error = %err, "command rejected");
                let task_id = request.task_id.clone();
                let command = request.command.clone();
                let reason = err.to_string();
                if let Err(audit_err) = self
                    .with_audit(move |audit| {
                        audit.record_rejection(task_id.as_deref(), &command, &reason)
                    })
                    .await
                {
                    warn!(error = %audit_err, "failed to audit rejected command");
                }
                return Err(err);
            }
        };

        let timeout = request
            .timeout
            .or_else(|| policy.as_ref().and_then(CommandPolicy::timeout))
            .unwrap_or(self.settings.default_timeout);

        let audit_id = {
            let task_id = request.task_id.clone();
            let command = request.command.clone();
            let cwd = request.cwd.clone();
            self.with_audit(move |audit| audit.record_start(task_id.as_deref(), &command, Some(cwd)))
                .await?
        };
        debug!(command = %request.display(), cwd = %request.cwd.display(), ?timeout, "executing command");

        let raw = match self.spawn_and_wait(&request, timeout).await {
            Ok(raw) => raw,
            Err(err) => {
                self.finish_audit(
                    audit_id,
                    AuditCompletion {
                        outcome: AuditOutcome::Failed,
                        exit_code: None,
                        duration: Duration::ZERO,
                        stdout_bytes: 0,
                        stderr_bytes: 0,
                        detail: Some(err.to_string()),
                    },
                )
                .await;
                return Err(err);
            }
        };

        match raw {
            RawOutcome::TimedOut { duration } => {
                warn!(command = %request.display(), ?timeout, "command timed out and was killed");
                self.finish_audit(
                    audit_id,
                    AuditCompletion {
                        outcome: AuditOutcome::Killed,
                        exit_code: Some(KILLED_EXIT_CODE),
                        duration,
                        stdout_bytes: 0,
                        stderr_bytes: 0,
                        detail: Some(format!("timed out after {:?}", timeout)),
                    },
                )
                .await;
                if request.allow_failure {
                    Ok(CommandResult {
                        command: request.command.clone(),
                        exit_code: KILLED_EXIT_CODE,
                        stdout: String::new(),
                        stderr: String::new(),
                        stdout_truncated: false,
                        stderr_truncated: false,
                        duration_ms: millis(duration),
                        killed: true,
                    })
                } else {
                    Err(GatewayError::TimedOut {
                        command: request.display(),
                        after: timeout,
                    })
                }
            }
            RawOutcome::Exited { output, duration } => {
                let killed = output.status.code().is_none();
                let exit_code = output.status.code().unwrap_or(KILLED_EXIT_CODE);
                let outcome = match (killed, exit_code) {
                    (true, _) => AuditOutcome::Killed,
                    (false, 0) => AuditOutcome::Succeeded,
                    _ => AuditOutcome::Failed,
                };
                self.finish_audit(
                    audit_id,
                    AuditCompletion {
                        outcome,
                        exit_code: Some(exit_code),
                        duration,
                        stdout_bytes: output.stdout.len() as u64,
                        stderr_bytes: output.stderr.len() as u64,
                        detail: None,
                    },
                )
                .await;

                let (stdout, stdout_truncated) = cap_output(&output.stdout, self.settings.max_output_bytes);
                let (stderr, stderr_truncated) = cap_output(&output.stderr, self.settings.max_output_bytes);
                let result = CommandResult {
                    command: request.command.clone(),
                    exit_code,
                    stdout,
                    stderr,
                    stdout_truncated,
                    stderr_truncated,
                    duration_ms: millis(duration),
                    killed,
                };

                if result.success() {
                    info!(command = %request.display(), duration_ms = result.duration_ms, "command succeeded");
                    Ok(result)
                } else if request.allow_failure {
                    debug!(command = %request.display(), exit_code, "command failed (allowed)");
                    Ok(result)
                } else {
                    Err(GatewayError::NonZeroExit {
                        command: request.display(),
                        exit_code,
                        stderr: result.stderr.trim().to_string(),
                    })
                }
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        request: &CommandRequest,
        timeout: Duration,
    ) -> Result<RawOutcome, GatewayError> {
        let program = &request.command[0];
        let mut cmd = Command::new(program);
        cmd.args(&request.command[1..])
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let started = Instant::now();
        let child = cmd.spawn().map_err(|source| GatewayError::SpawnFailed {
            program: program.clone(),
            source,
        })?;

        // Dropping the child on timeout kills it (kill_on_drop).
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(RawOutcome::Exited {
                output,
                duration: started.elapsed(),
            }),
            Ok(Err(source)) => Err(GatewayError::Io {
                command: request.display(),
                source,
            }),
            Err(_) => Ok(RawOutcome::TimedOut {
                duration: started.elapsed(),
            }),
        }
    }

    /// Run an audit store operation on the blocking pool. Every audit write
    /// rewrites the whole document, which is too slow for an async worker
    /// once retention fills up.
    async fn with_audit<R, F>(&self, f: F) -> Result<R, GatewayError>
    where
        F: FnOnce(&AuditLogger) -> Result<R, GatewayError> + Send + 'static,
        R: Send + 'static,
    {
        let audit = Arc::clone(&self.audit);
        tokio::task::spawn_blocking(move || f(&audit)).await?
    }

    async fn finish_audit(&self, audit_id: String, completion: AuditCompletion) {
        let id = audit_id.clone();
        if let Err(e) = self
            .with_audit(move |audit| audit.record_outcome(&id, completion))
            .await
        {
            warn!(error = %e, audit_id = %audit_id, "failed to record command outcome");
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Lossy UTF-8 of at most `max` bytes, and whether anything was cut.
fn cap_output(bytes: &[u8], max: usize) -> (String, bool) {
    if bytes.len() <= max {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }
    (String::from_utf8_lossy(&bytes[..max]).into_owned(), true)
}
