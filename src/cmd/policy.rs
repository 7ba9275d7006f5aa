//! `foreman policy`, `foreman audit`.

use anyhow::{Result, anyhow};
use console::style;

use foreman::config::ForemanConfig;
use foreman::gateway::rules::compile_patterns;
use foreman::gateway::{AuditFilter, AuditLogger, AuditOutcome, CommandPolicy, PolicyStore};

use super::fmt_time;
use crate::PolicyCommands;

fn print_policy(policy: &CommandPolicy) {
    let list = |items: &[String]| {
        if items.is_empty() {
            "-".to_string()
        } else {
            items.join(", ")
        }
    };
    println!("{} {}", style("Policy for").bold(), style(&policy.task_id).cyan());
    println!("  allow:          {}", list(&policy.allow));
    println!("  deny:           {}", list(&policy.deny));
    println!("  deny patterns:  {}", list(&policy.deny_patterns));
    println!(
        "  max concurrent: {}",
        policy
            .max_concurrent
            .map(|n| n.to_string())
            .unwrap_or_else(|| "global default".to_string())
    );
    println!(
        "  timeout:        {}",
        policy
            .timeout_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "global default".to_string())
    );
    println!("  updated:        {}", fmt_time(policy.updated_at));
}

pub fn cmd_policy(config: &ForemanConfig, command: PolicyCommands) -> Result<()> {
    let store = PolicyStore::new(config.policies_file());
    match command {
        PolicyCommands::Show { task_id } => match store.get_policy(&task_id)? {
            Some(policy) => print_policy(&policy),
            None => println!("No policy for {}; the global baseline applies.", task_id),
        },
        PolicyCommands::Set {
            task_id,
            allow,
            deny,
            deny_patterns,
            max_concurrent,
            timeout_ms,
        } => {
            let compiled = compile_patterns(&deny_patterns);
            if compiled.len() != deny_patterns.len() {
                println!(
                    "{} some deny patterns are not valid regexes and will be ignored",
                    style("Warning:").yellow()
                );
            }
            let policy = store.set_policy(CommandPolicy {
                allow,
                deny,
                deny_patterns,
                max_concurrent,
                timeout_ms,
                ..CommandPolicy::new(task_id)
            })?;
            print_policy(&policy);
        }
        PolicyCommands::Clear { task_id } => {
            if store.remove_policy(&task_id)? {
                println!("Removed policy for {}.", task_id);
            } else {
                println!("No policy for {}.", task_id);
            }
        }
    }
    Ok(())
}

pub fn cmd_audit(
    config: &ForemanConfig,
    task: Option<String>,
    outcome: Option<&str>,
    limit: usize,
) -> Result<()> {
    let outcome = outcome
        .map(|o| o.parse::<AuditOutcome>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let logger = AuditLogger::new(config.audit_file(), config.toml.gateway.audit_retention);
    let entries = logger.entries(&AuditFilter {
        task_id: task,
        outcome,
        limit: Some(limit),
    })?;

    if entries.is_empty() {
        println!("No audit entries.");
        return Ok(());
    }
    println!(
        "{:<20} {:<10} {:<15} {:>6} {:>8}  COMMAND",
        "STARTED", "OUTCOME", "TASK", "EXIT", "MS"
    );
    for entry in entries {
        let outcome = format!("{:<10}", entry.outcome.as_str());
        let outcome = match entry.outcome {
            AuditOutcome::Succeeded => style(outcome).green(),
            AuditOutcome::Failed | AuditOutcome::Killed => style(outcome).red(),
            AuditOutcome::Rejected => style(outcome).yellow(),
            AuditOutcome::Started => style(outcome).dim(),
        };
        println!(
            "{:<20} {} {:<15} {:>6} {:>8}  {}",
            fmt_time(entry.started_at),
            outcome,
            entry.task_id.as_deref().unwrap_or("-"),
            entry
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry
                .duration_ms
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.command.join(" ")
        );
        if let Some(detail) = &entry.detail {
            println!("    {}", style(detail).dim());
        }
    }
    Ok(())
}
