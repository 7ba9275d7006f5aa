use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// ```text
/// created ──► mutating ──► verifying ──► ready ──► pr_opened
///                 ▲            │  ▲         │
///                 │            ▼  │         │
///                 │          fixing         │
///                 └─────────────────────────┘
/// any non-terminal state ──► failed ──► {created, ready, mutating}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Mutating,
    Verifying,
    Fixing,
    Ready,
    PrOpened,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Created,
        Self::Mutating,
        Self::Verifying,
        Self::Fixing,
        Self::Ready,
        Self::PrOpened,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Mutating => "mutating",
            Self::Verifying => "verifying",
            Self::Fixing => "fixing",
            Self::Ready => "ready",
            Self::PrOpened => "pr_opened",
            Self::Failed => "failed",
        }
    }

    /// Whether moving from `self` to `to` is allowed. Staying put always is.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (Created, Mutating | Failed)
                | (Mutating, Verifying | Failed)
                | (Verifying, Ready | Fixing | Failed)
                | (Fixing, Verifying | Failed)
                | (Ready, PrOpened | Mutating | Failed)
                | (Failed, Created | Ready | Mutating)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PrOpened)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "mutating" => Ok(Self::Mutating),
            "verifying" => Ok(Self::Verifying),
            "fixing" => Ok(Self::Fixing),
            "ready" => Ok(Self::Ready),
            "pr_opened" => Ok(Self::PrOpened),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}
