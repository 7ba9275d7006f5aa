use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use foreman::config::ForemanConfig;
use foreman::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Control plane for autonomous coding-agent runs")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .foreman/ with a default foreman.toml
    Init,
    /// Start an autonomous run and follow it until it finishes
    Run {
        /// What the agent should achieve
        objective: String,
        /// Do not open a pull request
        #[arg(long)]
        no_pr: bool,
        /// Do not commit (implies --no-pr)
        #[arg(long)]
        no_commit: bool,
        /// Merge queue priority for the resulting PR
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i32,
    },
    /// Show one run, or list all runs
    Status { run_id: Option<String> },
    /// Ask a run to stop at its next phase boundary
    Cancel { run_id: String },
    /// List tasks
    Tasks,
    /// Show a task's execution plan
    Plan { task_id: String },
    /// Inspect and maintain the merge queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Scheduled maintenance jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Per-task command policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
    /// Show the command audit log
    Audit {
        #[arg(long)]
        task: Option<String>,
        /// started, succeeded, failed, killed or rejected
        #[arg(long)]
        outcome: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// List entries in merge order
    List,
    /// Take the next ready entry and mark it merging
    Next,
    /// Record that a task's branch landed on the integration branch
    Merged { task_id: String },
    /// Drop a task's entry
    Remove { task_id: String },
    /// Compare a task's branch with the integration branch
    Freshness { task_id: String },
    /// Rebase a task's branch onto the integration branch
    Rebase { task_id: String },
}

#[derive(Subcommand, Clone)]
pub enum JobsCommands {
    /// Show every job with its counters
    List,
    /// Run a job now
    Trigger { name: String },
    /// Change how often a job runs
    Interval { name: String, secs: u64 },
    /// Run the scheduler in the foreground until interrupted
    Serve,
}

#[derive(Subcommand, Clone)]
pub enum PolicyCommands {
    Show {
        task_id: String,
    },
    /// Create or replace a task's policy
    Set {
        task_id: String,
        /// Extra binaries to allow (comma-separated)
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,
        /// Binaries to deny (comma-separated)
        #[arg(long, value_delimiter = ',')]
        deny: Vec<String>,
        /// Regex matched against the joined command (repeatable)
        #[arg(long = "deny-pattern")]
        deny_patterns: Vec<String>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    Clear {
        task_id: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default foreman.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = ForemanConfig::with_cli_args(project_dir, cli.verbose)?;

    let log_dir = config.state_dir.exists().then(|| config.log_dir());
    let _log_guard = logging::init(
        log_dir.as_deref(),
        LogOptions {
            verbose: cli.verbose,
            json: cli.log_json,
        },
    );

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Run {
            objective,
            no_pr,
            no_commit,
            priority,
        } => {
            cmd::cmd_run(&config, objective, *no_commit, *no_pr, *priority).await?;
        }
        Commands::Status { run_id } => cmd::cmd_status(&config, run_id.as_deref())?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, run_id)?,
        Commands::Tasks => cmd::cmd_tasks(&config)?,
        Commands::Plan { task_id } => cmd::cmd_plan(&config, task_id)?,
        Commands::Queue { command } => cmd::cmd_queue(&config, command.clone()).await?,
        Commands::Jobs { command } => cmd::cmd_jobs(&config, command.clone()).await?,
        Commands::Policy { command } => cmd::cmd_policy(&config, command.clone())?,
        Commands::Audit {
            task,
            outcome,
            limit,
        } => cmd::cmd_audit(&config, task.clone(), outcome.as_deref(), *limit)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
