//! Execution plans: four linearly chained phases per task.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::PlanError;
use crate::store::DocumentStore;

pub const PHASE_NAMES: [&str; 4] = ["Analysis", "Implementation", "Testing", "Verification"];

const IMPLEMENTATION_BASE_LOC: u32 = 100;
const TESTING_BASE_LOC: u32 = 50;
const WORDS_PER_COMPLEXITY_STEP: usize = 50;
const MIN_COMPLEXITY: u32 = 2;
const MAX_COMPLEXITY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub status: PhaseStatus,
    pub estimated_loc: u32,
    /// Indices of phases that must complete first. Always lower than this
    /// phase's own index in a well-formed plan.
    pub dependencies: Vec<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub task_id: String,
    pub description: String,
    pub complexity: u32,
    pub phases: Vec<Phase>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlanDocument {
    pub plans: BTreeMap<String, ExecutionPlan>,
}

/// Complexity factor from the description's word count, in `[2, 5]`.
pub fn complexity_factor(description: &str) -> u32 {
    let words = description.split_whitespace().count();
    let steps = u32::try_from(words / WORDS_PER_COMPLEXITY_STEP).unwrap_or(u32::MAX);
    MIN_COMPLEXITY
        .saturating_add(steps)
        .clamp(MIN_COMPLEXITY, MAX_COMPLEXITY)
}

/// Build the four-phase plan for a task without persisting it.
pub fn build_plan(task_id: &str, description: &str) -> ExecutionPlan {
    let complexity = complexity_factor(description);
    let now = Utc::now();
    let phases = PHASE_NAMES
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let estimated_loc = match *name {
                "Implementation" => IMPLEMENTATION_BASE_LOC * complexity,
                "Testing" => TESTING_BASE_LOC * complexity,
                _ => 0,
            };
            Phase {
                name: name.to_string(),
                status: PhaseStatus::Pending,
                estimated_loc,
                dependencies: if i == 0 { vec![] } else { vec![i - 1] },
                started_at: None,
                completed_at: None,
            }
        })
        .collect();

    ExecutionPlan {
        task_id: task_id.to_string(),
        description: description.to_string(),
        complexity,
        phases,
        created_at: now,
        updated_at: now,
    }
}

/// Structural and progress problems in a plan. Never fails; an empty list
/// means the plan is consistent.
pub fn validate_plan(plan: &ExecutionPlan) -> Vec<String> {
    let mut problems = Vec::new();
    let len = plan.phases.len();

    for (i, phase) in plan.phases.iter().enumerate() {
        for &dep in &phase.dependencies {
            if dep >= len {
                problems.push(format!(
                    "Phase {} ({}) depends on out-of-range index {}",
                    i, phase.name, dep
                ));
            } else if dep >= i {
                problems.push(format!(
                    "Phase {} ({}) depends on later or same phase {}",
                    i, phase.name, dep
                ));
            }
        }

        if phase.status == PhaseStatus::InProgress {
            let incomplete: Vec<String> = phase
                .dependencies
                .iter()
                .filter_map(|&dep| plan.phases.get(dep).map(|p| (dep, p)))
                .filter(|(_, p)| p.status != PhaseStatus::Completed)
                .map(|(dep, p)| format!("{} ({})", dep, p.name))
                .collect();
            if !incomplete.is_empty() {
                problems.push(format!(
                    "Phase {} ({}) is in progress but dependencies are not completed: {}",
                    i,
                    phase.name,
                    incomplete.join(", ")
                ));
            }
        }
    }

    problems
}

pub struct ExecutionPlanManager {
    store: DocumentStore<PlanDocument>,
    write_lock: Mutex<()>,
}

impl ExecutionPlanManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: DocumentStore::new(path),
            write_lock: Mutex::new(()),
        }
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut PlanDocument) -> Result<R, PlanError>,
    ) -> Result<R, PlanError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.store.update(f)
    }

    pub fn create_plan(&self, task_id: &str, description: &str) -> Result<ExecutionPlan, PlanError> {
        self.mutate(|doc| {
            if doc.plans.contains_key(task_id) {
                return Err(PlanError::DuplicatePlan {
                    task_id: task_id.to_string(),
                });
            }
            let plan = build_plan(task_id, description);
            debug!(task_id, complexity = plan.complexity, "execution plan created");
            doc.plans.insert(task_id.to_string(), plan.clone());
            Ok(plan)
        })
    }

    pub fn get_plan(&self, task_id: &str) -> Result<Option<ExecutionPlan>, PlanError> {
        Ok(self.store.load()?.plans.remove(task_id))
    }

    pub fn list_plans(&self) -> Result<Vec<ExecutionPlan>, PlanError> {
        Ok(self.store.load()?.plans.into_values().collect())
    }

    /// Set a phase's status, stamping `started_at` on its first entry to
    /// `in_progress` and `completed_at` on entry to a finished state.
    pub fn update_phase_status(
        &self,
        task_id: &str,
        index: usize,
        status: PhaseStatus,
    ) -> Result<ExecutionPlan, PlanError> {
        self.mutate(|doc| {
            let plan = doc
                .plans
                .get_mut(task_id)
                .ok_or_else(|| PlanError::PlanNotFound {
                    task_id: task_id.to_string(),
                })?;
            let len = plan.phases.len();
            let phase = plan
                .phases
                .get_mut(index)
                .ok_or_else(|| PlanError::PhaseOutOfRange {
                    task_id: task_id.to_string(),
                    index,
                    len,
                })?;

            let now = Utc::now();
            let entering = phase.status != status;
            phase.status = status;
            if status == PhaseStatus::InProgress && phase.started_at.is_none() {
                phase.started_at = Some(now);
            }
            if status.is_finished() && entering {
                phase.completed_at = Some(now);
            }
            plan.updated_at = now;
            Ok(plan.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, ExecutionPlanManager) {
        let dir = tempdir().unwrap();
        let manager = ExecutionPlanManager::new(dir.path().join("plans.json"));
        (dir, manager)
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn plan_has_four_chained_phases() {
        let (_dir, manager) = setup();
        let plan = manager.create_plan("t-1", "Add a --json flag").unwrap();
        let names: Vec<_> = plan.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, PHASE_NAMES);
        let deps: Vec<_> = plan.phases.iter().map(|p| p.dependencies.clone()).collect();
        assert_eq!(deps, vec![vec![], vec![0], vec![1], vec![2]]);
        assert_eq!(plan.phases[0].estimated_loc, 0);
        assert_eq!(plan.phases[3].estimated_loc, 0);
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn complexity_is_bounded() {
        assert_eq!(complexity_factor(""), 2);
        assert_eq!(complexity_factor(&words(49)), 2);
        assert_eq!(complexity_factor(&words(50)), 3);
        assert_eq!(complexity_factor(&words(150)), 5);
        assert_eq!(complexity_factor(&words(10_000)), 5);
    }

    #[test]
    fn longer_descriptions_never_shrink_estimates() {
        let mut previous = 0;
        for n in (0..400).step_by(7) {
            let plan = build_plan("t", &words(n));
            let loc = plan.phases[1].estimated_loc;
            assert!(loc >= previous, "{} words gave {} < {}", n, loc, previous);
            assert!((200..=500).contains(&loc));
            previous = loc;
        }
    }

    #[test]
    fn duplicate_plan_is_rejected() {
        let (_dir, manager) = setup();
        manager.create_plan("t-1", "x").unwrap();
        assert!(matches!(
            manager.create_plan("t-1", "y"),
            Err(PlanError::DuplicatePlan { .. })
        ));
    }

    #[test]
    fn status_updates_stamp_times() {
        let (_dir, manager) = setup();
        let created = manager.create_plan("t-1", "x").unwrap();

        let started = manager
            .update_phase_status("t-1", 0, PhaseStatus::InProgress)
            .unwrap();
        let first_start = started.phases[0].started_at.unwrap();
        assert!(started.phases[0].completed_at.is_none());
        assert!(started.updated_at >= created.updated_at);

        // Re-entering in_progress keeps the original start.
        let again = manager
            .update_phase_status("t-1", 0, PhaseStatus::InProgress)
            .unwrap();
        assert_eq!(again.phases[0].started_at, Some(first_start));

        let done = manager
            .update_phase_status("t-1", 0, PhaseStatus::Completed)
            .unwrap();
        assert!(done.phases[0].completed_at.is_some());
        assert_eq!(manager.get_plan("t-1").unwrap().unwrap(), done);
    }

    #[test]
    fn update_errors() {
        let (_dir, manager) = setup();
        assert!(matches!(
            manager.update_phase_status("missing", 0, PhaseStatus::Completed),
            Err(PlanError::PlanNotFound { .. })
        ));
        manager.create_plan("t-1", "x").unwrap();
        assert!(matches!(
            manager.update_phase_status("t-1", 4, PhaseStatus::Completed),
            Err(PlanError::PhaseOutOfRange { index: 4, len: 4, .. })
        ));
    }

    #[test]
    fn validate_flags_exactly_in_progress_phases_with_incomplete_deps() {
        let mut plan = build_plan("t", "x");
        plan.phases[0].status = PhaseStatus::Completed;
        plan.phases[1].status = PhaseStatus::InProgress;
        assert!(validate_plan(&plan).is_empty());

        plan.phases[0].status = PhaseStatus::Failed;
        plan.phases[3].status = PhaseStatus::InProgress;
        let problems = validate_plan(&plan);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].starts_with("Phase 1"));
        assert!(problems[1].starts_with("Phase 3"));

        // A pending phase with incomplete deps is fine.
        plan.phases[1].status = PhaseStatus::Pending;
        plan.phases[3].status = PhaseStatus::Pending;
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn validate_flags_bad_dependency_indices() {
        let mut plan = build_plan("t", "x");
        plan.phases[1].dependencies = vec![9];
        plan.phases[2].dependencies = vec![3];
        let problems = validate_plan(&plan);
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("out-of-range"));
        assert!(problems[1].contains("later"));
    }
}
