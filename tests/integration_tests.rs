//! Integration tests for the foreman CLI.
//!
//! Every test works on its own temporary project directory through
//! `--project-dir`, so nothing touches the real working tree.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a foreman Command
fn foreman() -> Command {
    cargo_bin_cmd!("foreman")
}

/// Helper to create a foreman Command bound to a project directory
fn foreman_in(dir: &TempDir) -> Command {
    let mut cmd = foreman();
    cmd.arg("--project-dir").arg(dir.path());
    cmd.env_remove("FOREMAN_AGENT_CMD");
    cmd.env_remove("FOREMAN_GATEWAY_ENABLED");
    cmd
}

/// Helper to create and initialize a temporary project
fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    foreman_in(&dir).arg("init").assert().success();
    dir
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_foreman_help() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("queue"));
    }

    #[test]
    fn test_foreman_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();

        foreman_in(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized foreman"));

        assert!(dir.path().join(".foreman/foreman.toml").exists());
        assert!(dir.path().join(".foreman/logs").is_dir());
        assert!(dir.path().join(".foreman/workspaces").is_dir());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = init_project();
        foreman_in(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        foreman().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_validate_defaults() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = init_project();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            r#"
[gateway]
deny_patterns = ["(unclosed"]

[orchestrator]
quality_threshold = 1.5
"#,
        )
        .unwrap();

        foreman_in(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"))
            .stdout(predicate::str::contains("(unclosed"))
            .stdout(predicate::str::contains("quality_threshold"));
    }

    #[test]
    fn test_config_show_uses_file_values() {
        let dir = init_project();
        fs::write(
            dir.path().join(".foreman/foreman.toml"),
            r#"
[merge_queue]
main_branch = "trunk"

[verify]
commands = [["cargo", "test"]]
"#,
        )
        .unwrap();

        foreman_in(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("main_branch = \"trunk\""))
            .stdout(predicate::str::contains("cargo test"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        foreman_in(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(dir.path().join(".foreman/foreman.toml").exists());

        foreman_in(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = init_project();
        fs::write(dir.path().join(".foreman/foreman.toml"), "[gateway\n").unwrap();
        foreman_in(&dir).arg("tasks").assert().failure();
    }
}

// =============================================================================
// Empty-state listings
// =============================================================================

mod listings {
    use super::*;

    #[test]
    fn test_tasks_empty() {
        let dir = init_project();
        foreman_in(&dir)
            .arg("tasks")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks."));
    }

    #[test]
    fn test_status_without_runs() {
        let dir = init_project();
        foreman_in(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs yet"));
    }

    #[test]
    fn test_status_unknown_run_fails() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["status", "run-missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("run-missing"));
    }

    #[test]
    fn test_plan_unknown_task_fails() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["plan", "task-missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No execution plan"));
    }

    #[test]
    fn test_queue_list_empty() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["queue", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Merge queue is empty."));
    }

    #[test]
    fn test_queue_remove_missing_entry() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["queue", "remove", "task-missing"])
            .assert()
            .success()
            .stdout(predicate::str::contains("not in the merge queue"));
    }
}

// =============================================================================
// Merge queue hand-off
// =============================================================================

mod merge_queue {
    use super::*;

    fn seed_queue(dir: &TempDir) {
        fs::write(
            dir.path().join(".foreman/merge-queue.json"),
            r#"{
  "version": 1,
  "updated_at": "2026-01-01T00:00:00Z",
  "data": {
    "entries": [
      {
        "task_id": "task-low",
        "branch": "foreman/task-low",
        "pr_number": null,
        "pr_url": null,
        "priority": 0,
        "status": "waiting",
        "conflict_detected": false,
        "enqueued_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z"
      },
      {
        "task_id": "task-high",
        "branch": "foreman/task-high",
        "pr_number": 7,
        "pr_url": "https://example.com/pr/7",
        "priority": 5,
        "status": "ready",
        "conflict_detected": false,
        "enqueued_at": "2026-01-01T00:01:00Z",
        "updated_at": "2026-01-01T00:01:00Z"
      }
    ]
  }
}"#,
        )
        .unwrap();
    }

    #[test]
    fn test_queue_next_empty() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["queue", "next"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Merge queue is empty."));
    }

    #[test]
    fn test_queue_next_takes_highest_priority_then_merged() {
        let dir = init_project();
        seed_queue(&dir);

        foreman_in(&dir)
            .args(["queue", "next"])
            .assert()
            .success()
            .stdout(predicate::str::contains("task-high"))
            .stdout(predicate::str::contains("merging"));

        foreman_in(&dir)
            .args(["queue", "merged", "task-high"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Merged task-high"));

        foreman_in(&dir)
            .args(["queue", "next"])
            .assert()
            .success()
            .stdout(predicate::str::contains("task-low"));

        foreman_in(&dir)
            .args(["queue", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("merged"))
            .stdout(predicate::str::contains("merging"));
    }

    #[test]
    fn test_queue_merged_unknown_task_fails() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["queue", "merged", "task-missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No merge queue entry"));
    }
}

// =============================================================================
// Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_cancel_unknown_run_fails() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["cancel", "run-missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_empty_objective_is_rejected() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["run", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Objective must not be empty"));
        assert!(!dir.path().join(".foreman/runs.json").exists());
    }

    #[test]
    fn test_run_outside_git_repo_is_recorded_as_failed() {
        // Not a git repository, so provisioning the worktree fails before
        // the agent is ever started.
        let dir = init_project();
        foreman_in(&dir)
            .args(["run", "add a README", "--no-pr"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("failed"));

        foreman_in(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("add a README"));
    }
}

// =============================================================================
// Scheduler
// =============================================================================

mod jobs {
    use super::*;

    #[test]
    fn test_jobs_list_shows_every_job() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["jobs", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("merge_queue_refresh"))
            .stdout(predicate::str::contains("stale_task_sweep"))
            .stdout(predicate::str::contains("audit_compaction"))
            .stdout(predicate::str::contains("workspace_cleanup"));
    }

    #[test]
    fn test_jobs_interval_below_minimum_fails() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["jobs", "interval", "audit_compaction", "10"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("at least 60s"));
    }

    #[test]
    fn test_jobs_interval_persists() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["jobs", "interval", "stale_task_sweep", "120"])
            .assert()
            .success()
            .stdout(predicate::str::contains("every 120s"));

        foreman_in(&dir)
            .args(["jobs", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("120s"));
    }

    #[test]
    fn test_jobs_trigger_unknown_job_fails() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["jobs", "trigger", "defrag"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Known jobs"));
    }

    #[test]
    fn test_jobs_trigger_records_run() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["jobs", "trigger", "stale_task_sweep"])
            .assert()
            .success()
            .stdout(predicate::str::contains("failed 0 stale tasks"));
        assert!(dir.path().join(".foreman/scheduler.json").exists());
    }
}

// =============================================================================
// Policies and audit
// =============================================================================

mod policies {
    use super::*;

    #[test]
    fn test_policy_set_show_clear() {
        let dir = init_project();
        foreman_in(&dir)
            .args([
                "policy",
                "set",
                "task-1",
                "--allow",
                "jq,curl",
                "--deny",
                "rm",
                "--timeout-ms",
                "5000",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("jq, curl"));

        foreman_in(&dir)
            .args(["policy", "show", "task-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("rm"))
            .stdout(predicate::str::contains("5000ms"));

        foreman_in(&dir)
            .args(["policy", "clear", "task-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed policy for task-1."));

        foreman_in(&dir)
            .args(["policy", "show", "task-1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("global baseline applies"));
    }

    #[test]
    fn test_audit_empty() {
        let dir = init_project();
        foreman_in(&dir)
            .arg("audit")
            .assert()
            .success()
            .stdout(predicate::str::contains("No audit entries."));
    }

    #[test]
    fn test_audit_rejects_unknown_outcome() {
        let dir = init_project();
        foreman_in(&dir)
            .args(["audit", "--outcome", "exploded"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid audit outcome"));
    }
}
