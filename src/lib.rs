//! Foreman: a control plane for autonomous coding-agent workflows.
//!
//! The agent subprocess is driven through [`protocol`]; durable state lives
//! in the [`registry`], [`plan`], [`merge_queue`] and run stores; every
//! external command goes through the [`gateway`]. [`orchestrator`] ties them
//! together into phased runs and [`scheduler`] runs maintenance jobs.

pub mod config;
pub mod errors;
pub mod gateway;
pub mod logging;
pub mod merge_queue;
pub mod orchestrator;
pub mod plan;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod store;
