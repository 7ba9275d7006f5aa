//! `foreman jobs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use console::style;

use foreman::config::ForemanConfig;
use foreman::gateway::CommandGateway;
use foreman::orchestrator::RunStores;
use foreman::scheduler::{JobName, JobScheduler, jobs};

use super::{fmt_opt_time, fmt_time};
use crate::JobsCommands;

fn parse_job(name: &str) -> Result<JobName> {
    JobName::from_str_opt(name).ok_or_else(|| {
        let known = JobName::ALL
            .iter()
            .map(|j| j.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow!("Unknown job '{}'. Known jobs: {}", name, known)
    })
}

fn open_scheduler(config: &ForemanConfig) -> Result<Arc<JobScheduler>> {
    let scheduler = JobScheduler::from_config(config)?;
    let gateway = Arc::new(CommandGateway::from_config(config));
    jobs::register_defaults(&scheduler, config, gateway, &RunStores::from_config(config));
    Ok(Arc::new(scheduler))
}

pub async fn cmd_jobs(config: &ForemanConfig, command: JobsCommands) -> Result<()> {
    let scheduler = open_scheduler(config)?;
    match command {
        JobsCommands::List => {
            println!(
                "{:<22} {:>9} {:>6} {:>6} {:>6} {:<20} {:<20}",
                "JOB", "INTERVAL", "RUNS", "OK", "FAIL", "LAST RUN", "NEXT RUN"
            );
            for job in scheduler.jobs()? {
                println!(
                    "{:<22} {:>8}s {:>6} {:>6} {:>6} {:<20} {:<20}",
                    job.name.as_str(),
                    job.interval_secs,
                    job.run_count,
                    job.success_count,
                    job.failure_count,
                    fmt_opt_time(job.last_run_at),
                    job.next_run_at
                        .map(fmt_time)
                        .unwrap_or_else(|| "due".to_string())
                );
                if let Some(err) = &job.last_error {
                    println!("    {} {}", style("last error:").red(), err);
                }
            }
        }
        JobsCommands::Trigger { name } => {
            let name = parse_job(&name)?;
            let run = scheduler.trigger_job(name).await?;
            if run.success {
                println!(
                    "{} {} in {}ms: {}",
                    style("✓").green(),
                    name,
                    run.duration_ms,
                    run.summary.as_deref().unwrap_or("done")
                );
            } else {
                println!(
                    "{} {} failed after {}ms: {}",
                    style("✗").red(),
                    name,
                    run.duration_ms,
                    run.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        JobsCommands::Interval { name, secs } => {
            let name = parse_job(&name)?;
            let state = scheduler.set_interval(name, Duration::from_secs(secs))?;
            println!("{} now runs every {}s.", name, state.interval_secs);
        }
        JobsCommands::Serve => {
            scheduler.start();
            println!(
                "{} (Ctrl-C to stop)",
                style("Scheduler running").bold().cyan()
            );
            tokio::signal::ctrl_c().await?;
            scheduler.stop().await;
            println!("Scheduler stopped.");
        }
    }
    Ok(())
}
