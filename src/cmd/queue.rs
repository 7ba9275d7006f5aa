//! `foreman queue`.

use anyhow::{Context, Result};
use console::style;

use foreman::config::ForemanConfig;
use foreman::gateway::{CommandGateway, CommandRequest};
use foreman::merge_queue::{GitRepo, MergeQueue, MergeQueueEntry, MergeStatus, RebaseOutcome};

use super::fmt_time;
use crate::QueueCommands;

fn open_queue(config: &ForemanConfig) -> MergeQueue {
    MergeQueue::new(
        config.merge_queue_file(),
        config.toml.merge_queue.main_branch.clone(),
    )
}

fn print_entry(entry: &MergeQueueEntry) {
    println!("  task:     {}", entry.task_id);
    println!("  branch:   {}", entry.branch);
    println!("  status:   {}", entry.status);
    println!("  priority: {}", entry.priority);
    if let Some(url) = &entry.pr_url {
        println!("  pr:       {}", url);
    } else if let Some(number) = entry.pr_number {
        println!("  pr:       #{}", number);
    }
}

/// Publish a rebased branch that already backs a PR. The lease refuses the
/// push if the remote moved since our last fetch.
async fn push_rebased(config: &ForemanConfig, entry: &MergeQueueEntry) -> Result<()> {
    let gateway = CommandGateway::from_config(config);
    let remote = &config.toml.merge_queue.remote;
    let request = CommandRequest::new(
        ["git", "push", "--force-with-lease", remote.as_str(), entry.branch.as_str()],
        &config.project_dir,
    )
    .for_task(entry.task_id.as_str());
    gateway
        .execute(request)
        .await
        .with_context(|| format!("Failed to push {} to {}", entry.branch, remote))?;
    Ok(())
}

pub async fn cmd_queue(config: &ForemanConfig, command: QueueCommands) -> Result<()> {
    let queue = open_queue(config);
    match command {
        QueueCommands::List => {
            let entries = queue.list()?;
            if entries.is_empty() {
                println!("Merge queue is empty.");
                return Ok(());
            }
            println!(
                "{:<4} {:<15} {:<9} {:<4} {:<28} {:<6} {:<20}",
                "POS", "TASK", "STATUS", "PRI", "BRANCH", "PR", "ENQUEUED"
            );
            let mut position = 0;
            for entry in entries {
                let pos = if entry.status == MergeStatus::Merged {
                    "-".to_string()
                } else {
                    position += 1;
                    position.to_string()
                };
                let status = format!("{:<9}", entry.status.as_str());
                let status = match entry.status {
                    MergeStatus::Ready | MergeStatus::Merged => style(status).green(),
                    MergeStatus::Blocked => style(status).red(),
                    _ => style(status),
                };
                println!(
                    "{:<4} {:<15} {} {:<4} {:<28} {:<6} {:<20}",
                    pos,
                    entry.task_id,
                    status,
                    entry.priority,
                    entry.branch,
                    entry
                        .pr_number
                        .map(|n| format!("#{}", n))
                        .unwrap_or_else(|| "-".to_string()),
                    fmt_time(entry.enqueued_at)
                );
                if entry.conflict_detected {
                    println!(
                        "     {} {}",
                        style("conflicts:").red(),
                        entry.conflict_files.join(", ")
                    );
                }
            }
        }
        QueueCommands::Next => match queue.dequeue()? {
            Some(entry) => {
                println!("{} next entry to merge:", style("Merging").green().bold());
                print_entry(&entry);
                println!();
                println!("Run 'foreman queue merged {}' once it lands.", entry.task_id);
            }
            None => println!("Merge queue is empty."),
        },
        QueueCommands::Merged { task_id } => {
            let entry = queue.mark_merged(&task_id)?;
            println!("{} {} ({})", style("Merged").green(), entry.task_id, entry.branch);
        }
        QueueCommands::Remove { task_id } => {
            if queue.remove(&task_id)? {
                println!("Removed {} from the merge queue.", task_id);
            } else {
                println!("{} is not in the merge queue.", task_id);
            }
        }
        QueueCommands::Freshness { task_id } => {
            let repo = GitRepo::open(&config.project_dir)?;
            let freshness = queue.check_freshness(&task_id, &repo)?;
            let conflicts = queue.detect_conflicts(&task_id, &repo)?;
            if freshness.fresh {
                println!("{} is {} with {}", task_id, style("fresh").green(), queue.main_branch());
            } else {
                println!(
                    "{} is {}: {} commit(s) behind {}",
                    task_id,
                    style("stale").yellow(),
                    freshness.commits_behind,
                    queue.main_branch()
                );
            }
            println!("  merge-base: {}", freshness.merge_base);
            println!("  main tip:   {}", freshness.main_tip);
            if conflicts.has_conflicts {
                println!("  {} {}", style("conflicts:").red(), conflicts.files.join(", "));
            } else {
                println!("  merges cleanly");
            }
        }
        QueueCommands::Rebase { task_id } => {
            let repo = GitRepo::open(&config.project_dir)?;
            match queue.rebase_onto_main(&task_id, &repo)? {
                RebaseOutcome::Rebased { new_head } => {
                    println!(
                        "{} {} onto {} (head {})",
                        style("Rebased").green(),
                        task_id,
                        queue.main_branch(),
                        new_head
                    );
                    let entry = queue.get(&task_id)?;
                    if let Some(entry) = entry.filter(|e| e.pr_url.is_some() || e.pr_number.is_some()) {
                        push_rebased(config, &entry).await?;
                        println!(
                            "Pushed {} to {}",
                            entry.branch, config.toml.merge_queue.remote
                        );
                    }
                }
                RebaseOutcome::Conflicted { files } => {
                    println!(
                        "{} rebase aborted; {} is blocked on: {}",
                        style("Conflict:").red().bold(),
                        task_id,
                        files.join(", ")
                    );
                }
            }
        }
    }
    Ok(())
}
