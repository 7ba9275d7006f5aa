//! Typed error hierarchy for Foreman.
//!
//! One enum per subsystem:
//! - `StoreError`: document persistence
//! - `ProtocolError`: agent subprocess and RPC correlation
//! - `RegistryError`: task registry and its status machine
//! - `PlanError`: execution plans
//! - `GatewayError`: command policy violations and execution failures
//! - `MergeQueueError`: merge ordering and git probes
//! - `SchedulerError`: recurring maintenance jobs
//! - `RunError`: autonomous run records

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the versioned JSON document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize document for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} has document version {found}, newer than supported version {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

/// Errors from the agent protocol client.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Agent process is not running")]
    NotStarted,

    #[error("Failed to spawn agent process '{command}': {message}")]
    SpawnFailed { command: String, message: String },

    #[error("Failed to write to agent stdin: {0}")]
    WriteFailed(String),

    #[error("Request '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("Agent returned error {code} for '{method}': {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Agent process exited: {0}")]
    ProcessExited(String),

    #[error("Unexpected response to '{method}': {message}")]
    UnexpectedResponse { method: String, message: String },

    #[error("Agent client was reset")]
    Reset,
}

impl ProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

/// Errors from the task registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Task {id} already exists")]
    DuplicateTask { id: String },

    #[error("Branch '{branch}' is already bound to task {owner}")]
    BranchInUse { branch: String, owner: String },

    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Illegal task status transition from '{from}' to '{to}'")]
    IllegalTransition { from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the execution plan manager.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Execution plan for task {task_id} already exists")]
    DuplicatePlan { task_id: String },

    #[error("No execution plan for task {task_id}")]
    PlanNotFound { task_id: String },

    #[error("Phase index {index} out of range for task {task_id} ({len} phases)")]
    PhaseOutOfRange {
        task_id: String,
        index: usize,
        len: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the command execution gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Command execution is disabled")]
    Disabled,

    #[error("Empty command")]
    EmptyCommand,

    #[error("Policy violation ({rule}): {detail}")]
    PolicyViolation { rule: String, detail: String },

    #[error("Concurrency limit reached ({scope}: {limit} commands already running)")]
    ConcurrencyLimit { scope: String, limit: usize },

    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' timed out after {after:?}")]
    TimedOut { command: String, after: Duration },

    #[error("Command '{command}' exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("I/O error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Audit write did not complete: {0}")]
    AuditTask(#[from] tokio::task::JoinError),
}

impl GatewayError {
    pub fn policy(rule: impl Into<String>, detail: impl Into<String>) -> Self {
        GatewayError::PolicyViolation {
            rule: rule.into(),
            detail: detail.into(),
        }
    }

    /// True when the command never started because a rule rejected it.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::Disabled
                | GatewayError::EmptyCommand
                | GatewayError::PolicyViolation { .. }
                | GatewayError::ConcurrencyLimit { .. }
        )
    }
}

/// Errors from the merge queue.
#[derive(Debug, Error)]
pub enum MergeQueueError {
    #[error("No merge queue entry for task {task_id}")]
    EntryNotFound { task_id: String },

    #[error("Branch '{branch}' is checked out with uncommitted changes at {path}")]
    DirtyWorktree { branch: String, path: PathBuf },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the job scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unknown job '{0}'")]
    UnknownJob(String),

    #[error("No executor registered for job '{0}'")]
    NoExecutor(String),

    #[error("Job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Interval for job '{job}' must be at least {min_secs}s (got {got_secs}s)")]
    IntervalTooShort {
        job: String,
        min_secs: u64,
        got_secs: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the run store and orchestrator API. Failures inside a run
/// are recorded on the run record instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} is {status} and can no longer change")]
    Terminal { run_id: String, status: String },

    #[error("Run status cannot move from '{from}' to '{to}'")]
    IllegalStatus { from: String, to: String },

    #[error("Timed out after {after:?} waiting for run {run_id}")]
    WaitTimedOut { run_id: String, after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}
