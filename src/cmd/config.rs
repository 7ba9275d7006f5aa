//! Configuration view and validation commands, `foreman config`.

use anyhow::{Context, Result};

use foreman::config::{ForemanConfig, ForemanToml};

use crate::ConfigCommands;

fn print_sections(toml: &ForemanToml) {
    println!("[agent]");
    println!("  command = \"{}\"", toml.agent_cmd());
    if !toml.agent.args.is_empty() {
        println!("  args = {:?}", toml.agent.args);
    }
    println!("  request_timeout_secs = {}", toml.agent.request_timeout_secs);
    println!("  turn_timeout_secs = {}", toml.agent.turn_timeout_secs);
    if let Some(model) = &toml.agent.model {
        println!("  model = \"{}\"", model);
    }
    println!();

    println!("[gateway]");
    println!("  enabled = {}", toml.gateway_enabled());
    println!("  allowlist = {:?}", toml.gateway.allowlist);
    if !toml.gateway.deny_patterns.is_empty() {
        println!("  deny_patterns = {:?}", toml.gateway.deny_patterns);
    }
    println!("  max_concurrent = {}", toml.gateway.max_concurrent);
    println!(
        "  per_task_max_concurrent = {}",
        toml.gateway.per_task_max_concurrent
    );
    println!("  timeout_secs = {}", toml.gateway.timeout_secs);
    println!("  audit_retention = {}", toml.gateway.audit_retention);
    println!();

    println!("[merge_queue]");
    println!("  main_branch = \"{}\"", toml.merge_queue.main_branch);
    println!("  remote = \"{}\"", toml.merge_queue.remote);
    println!();

    println!("[scheduler]");
    println!("  tick_secs = {}", toml.scheduler.tick_secs);
    println!("  stale_task_secs = {}", toml.scheduler.stale_task_secs);
    for (job, secs) in &toml.scheduler.intervals {
        println!("  intervals.{} = {}", job, secs);
    }
    println!();

    println!("[orchestrator]");
    println!(
        "  max_fix_iterations = {}",
        toml.orchestrator.max_fix_iterations
    );
    println!(
        "  quality_threshold = {}",
        toml.orchestrator.quality_threshold
    );
    println!("  auto_commit = {}", toml.orchestrator.auto_commit);
    println!("  open_pr = {}", toml.orchestrator.open_pr);
    println!("  review_rounds = {}", toml.orchestrator.review_rounds);
    println!("  base_branch = \"{}\"", toml.orchestrator.base_branch);
    println!("  branch_prefix = \"{}\"", toml.orchestrator.branch_prefix);
    println!();

    println!("[verify]");
    if toml.verify.commands.is_empty() {
        println!("  (no verification commands; every phase passes verification)");
    }
    for command in &toml.verify.commands {
        println!("  {}", command.join(" "));
    }
    println!();
}

pub fn cmd_config(config: &ForemanConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foreman.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            // Environment overrides are already folded into agent_cmd and
            // gateway_enabled.
            print_sections(&config.toml);
            if !config_path.exists() {
                println!("Run 'foreman config init' to create a foreman.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ForemanToml::load(&config_path)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("foreman.toml already exists at {}", config_path.display());
                println!("Delete it first to regenerate the defaults.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.state_dir)
                .context("Failed to create state directory")?;
            ForemanToml::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
