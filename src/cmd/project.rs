//! `foreman init`.

use anyhow::Result;

use foreman::config::{ForemanConfig, ForemanToml};

pub fn cmd_init(config: &ForemanConfig) -> Result<()> {
    let already = config.state_dir.exists();
    config.ensure_directories()?;

    let config_path = config.config_file();
    if !config_path.exists() {
        ForemanToml::default().save(&config_path)?;
    }

    if already {
        println!(
            "Foreman already initialized at {}",
            config.state_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!("Initialized foreman at {}", config.state_dir.display());
    println!();
    println!("Created:");
    println!("  .foreman/");
    println!("  ├── foreman.toml   # Configuration (see `foreman config show`)");
    println!("  ├── logs/          # Daily rolling log files");
    println!("  └── workspaces/    # One git worktree per task");
    println!();
    println!("Next steps:");
    println!("  1. Add verification commands under [verify] in foreman.toml");
    println!("  2. Run `foreman run \"<objective>\"`");
    Ok(())
}
