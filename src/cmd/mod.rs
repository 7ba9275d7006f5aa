//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                 |
//! |-----------|----------------------------------|
//! | `project` | `Init`                           |
//! | `run`     | `Run`, `Status`, `Cancel`        |
//! | `tasks`   | `Tasks`, `Plan`                  |
//! | `queue`   | `Queue`                          |
//! | `jobs`    | `Jobs`                           |
//! | `policy`  | `Policy`, `Audit`                |
//! | `config`  | `Config`                         |

pub mod config;
pub mod jobs;
pub mod policy;
pub mod project;
pub mod queue;
pub mod run;
pub mod tasks;

pub use config::cmd_config;
pub use jobs::cmd_jobs;
pub use policy::{cmd_audit, cmd_policy};
pub use project::cmd_init;
pub use queue::cmd_queue;
pub use run::{cmd_cancel, cmd_run, cmd_status};
pub use tasks::{cmd_plan, cmd_tasks};

use chrono::{DateTime, Local, Utc};

/// Local wall-clock rendering used by every listing.
pub(crate) fn fmt_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn fmt_opt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(fmt_time).unwrap_or_else(|| "-".to_string())
}
