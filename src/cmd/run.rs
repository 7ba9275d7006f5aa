//! `foreman run`, `foreman status`, `foreman cancel`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use foreman::config::ForemanConfig;
use foreman::gateway::CommandGateway;
use foreman::orchestrator::{
    AutonomousOrchestrator, Collaborators, RunOptions, RunRecord, RunSettings, RunStatus,
    RunStore, RunStores,
};
use foreman::plan::PhaseStatus;

use super::{fmt_opt_time, fmt_time};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

fn styled_status(status: RunStatus) -> String {
    let text = status.as_str();
    match status {
        RunStatus::Completed => style(text).green().bold().to_string(),
        RunStatus::Failed => style(text).red().bold().to_string(),
        RunStatus::Cancelled => style(text).yellow().to_string(),
        RunStatus::Queued | RunStatus::Running => style(text).cyan().to_string(),
    }
}

fn progress_line(record: &RunRecord) -> String {
    let total = record.phases.len();
    match record
        .phases
        .iter()
        .enumerate()
        .find(|(_, p)| p.status == PhaseStatus::InProgress)
    {
        Some((index, phase)) => format!("Phase {}/{}: {}", index + 1, total, phase.name),
        None if total > 0 && record.phases.iter().all(|p| p.status.is_finished()) => {
            "Committing and opening pull request".to_string()
        }
        None => format!("{}...", record.status),
    }
}

fn print_run(record: &RunRecord) {
    println!();
    println!("{} {}", style("Run").bold(), style(&record.run_id).cyan());
    println!("  Status:     {}", styled_status(record.status));
    println!("  Task:       {}", record.task_id);
    println!("  Objective:  {}", record.objective);
    if let Some(branch) = &record.branch {
        println!("  Branch:     {}", branch);
    }
    println!("  Created:    {}", fmt_time(record.created_at));
    println!("  Finished:   {}", fmt_opt_time(record.finished_at));
    if record.cancel_requested && !record.status.is_terminal() {
        println!("  {}", style("Cancellation requested").yellow());
    }

    if !record.phases.is_empty() {
        println!();
        println!("  Phases:");
        for phase in &record.phases {
            let marker = match phase.status {
                PhaseStatus::Completed => style("✓").green(),
                PhaseStatus::Failed => style("✗").red(),
                PhaseStatus::InProgress => style("▶").cyan(),
                _ => style("·").dim(),
            };
            println!(
                "    {} {:<15} fixes: {}",
                marker, phase.name, phase.fix_iterations
            );
            if let Some(err) = &phase.error {
                println!("        {}", style(err.lines().next().unwrap_or("")).dim());
            }
        }
    }

    println!();
    if let Some(score) = record.quality_score {
        println!("  Quality:    {:.2}", score);
    }
    if let Some(hash) = &record.commit_hash {
        println!("  Commit:     {}", hash);
    }
    if let Some(url) = &record.pr_url {
        println!("  PR:         {}", url);
    }
    if let Some(err) = &record.pr_error {
        println!("  {} {}", style("PR error:").yellow(), err);
    }
    if let Some(err) = &record.review_error {
        println!("  {} {}", style("Review error:").yellow(), err);
    }
    if let Some(err) = &record.error {
        println!("  {} {}", style("Error:").red().bold(), err);
    }
}

pub async fn cmd_run(
    config: &ForemanConfig,
    objective: &str,
    no_commit: bool,
    no_pr: bool,
    priority: i32,
) -> Result<()> {
    if objective.trim().is_empty() {
        bail!("Objective must not be empty");
    }
    config.ensure_directories()?;

    let gateway = Arc::new(CommandGateway::from_config(config));
    let (collaborators, agent) = Collaborators::from_config(config, gateway);
    let orchestrator = AutonomousOrchestrator::new(
        RunStores::from_config(config),
        collaborators,
        RunSettings::from_config(config),
    );

    let started = orchestrator.start_run(
        objective,
        RunOptions {
            no_commit,
            no_pr,
            priority,
        },
    )?;
    println!(
        "{} {} (task {})",
        style("Started run").bold(),
        style(&started.run_id).cyan(),
        started.task_id
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("queued");

    let mut interrupted = false;
    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                orchestrator.cancel_run(&started.run_id)?;
                spinner.set_message("cancelling at the next phase boundary");
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                let current = orchestrator
                    .get_run(&started.run_id)?
                    .context("Run record disappeared")?;
                if current.status.is_terminal() {
                    break current;
                }
                if !interrupted {
                    spinner.set_message(progress_line(&current));
                }
            }
        }
    };
    spinner.finish_and_clear();
    agent.shutdown().await;

    print_run(&finished);
    match finished.status {
        RunStatus::Failed => bail!(
            "Run {} failed: {}",
            finished.run_id,
            finished.error.as_deref().unwrap_or("unknown error")
        ),
        _ => Ok(()),
    }
}

pub fn cmd_status(config: &ForemanConfig, run_id: Option<&str>) -> Result<()> {
    let runs = RunStore::new(config.runs_file());
    if let Some(run_id) = run_id {
        let record = runs
            .get(run_id)?
            .with_context(|| format!("Run {} not found", run_id))?;
        print_run(&record);
        return Ok(());
    }

    let all = runs.list()?;
    if all.is_empty() {
        println!("No runs yet. Start one with `foreman run \"<objective>\"`.");
        return Ok(());
    }
    println!(
        "{:<18} {:<11} {:<15} {:<20} OBJECTIVE",
        "RUN", "STATUS", "TASK", "CREATED"
    );
    for record in all {
        let objective: String = record.objective.chars().take(50).collect();
        println!(
            "{:<18} {:<11} {:<15} {:<20} {}",
            record.run_id,
            record.status.as_str(),
            record.task_id,
            fmt_time(record.created_at),
            objective
        );
    }
    Ok(())
}

pub fn cmd_cancel(config: &ForemanConfig, run_id: &str) -> Result<()> {
    let runs = RunStore::new(config.runs_file());
    let record = runs.request_cancel(run_id)?;
    if record.status.is_terminal() {
        println!(
            "Run {} is already {}; nothing to cancel.",
            record.run_id,
            styled_status(record.status)
        );
    } else {
        println!(
            "{} Run {} will stop at its next phase boundary.",
            style("Cancellation requested.").yellow(),
            record.run_id
        );
    }
    Ok(())
}
