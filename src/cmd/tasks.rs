//! `foreman tasks`, `foreman plan`.

use anyhow::{Context, Result};
use console::style;

use foreman::config::ForemanConfig;
use foreman::plan::{ExecutionPlanManager, PhaseStatus, validate_plan};
use foreman::registry::{TaskRegistry, TaskStatus};

use super::{fmt_opt_time, fmt_time};

fn styled_status(status: TaskStatus) -> String {
    let text = format!("{:<10}", status.as_str());
    match status {
        TaskStatus::PrOpened | TaskStatus::Ready => style(text).green().to_string(),
        TaskStatus::Failed => style(text).red().to_string(),
        TaskStatus::Created => style(text).dim().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

pub fn cmd_tasks(config: &ForemanConfig) -> Result<()> {
    let tasks = TaskRegistry::new(config.tasks_file()).list()?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<15} {:<10} {:<28} {:<20} OBJECTIVE",
        "TASK", "STATUS", "BRANCH", "UPDATED"
    );
    for task in tasks {
        let objective: String = task.objective.chars().take(40).collect();
        println!(
            "{:<15} {} {:<28} {:<20} {}",
            task.id,
            styled_status(task.status),
            task.branch_name,
            fmt_time(task.updated_at),
            objective
        );
        if let Some(err) = &task.last_error {
            println!("    {}", style(err.lines().next().unwrap_or("")).dim());
        }
    }
    Ok(())
}

pub fn cmd_plan(config: &ForemanConfig, task_id: &str) -> Result<()> {
    let plan = ExecutionPlanManager::new(config.plans_file())
        .get_plan(task_id)?
        .with_context(|| format!("No execution plan for task {}", task_id))?;

    println!();
    println!("{} {}", style("Plan for").bold(), style(&plan.task_id).cyan());
    println!("  {}", plan.description);
    println!("  Complexity: {}", plan.complexity);
    println!();
    println!(
        "  {:<3} {:<15} {:<12} {:>6}  {:<8} {:<20} {:<20}",
        "#", "PHASE", "STATUS", "LOC", "DEPS", "STARTED", "COMPLETED"
    );
    for (i, phase) in plan.phases.iter().enumerate() {
        let deps = phase
            .dependencies
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let status = match phase.status {
            PhaseStatus::Completed => style(format!("{:<12}", phase.status.as_str())).green(),
            PhaseStatus::Failed => style(format!("{:<12}", phase.status.as_str())).red(),
            _ => style(format!("{:<12}", phase.status.as_str())),
        };
        println!(
            "  {:<3} {:<15} {} {:>6}  {:<8} {:<20} {:<20}",
            i,
            phase.name,
            status,
            phase.estimated_loc,
            if deps.is_empty() { "-".to_string() } else { deps },
            fmt_opt_time(phase.started_at),
            fmt_opt_time(phase.completed_at)
        );
    }

    let problems = validate_plan(&plan);
    if !problems.is_empty() {
        println!();
        println!("{}", style("Plan problems:").yellow());
        for problem in problems {
            println!("  - {}", problem);
        }
    }
    println!();
    Ok(())
}
