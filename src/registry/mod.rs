//! Task registry: the durable record of every task and its status.
//!
//! Tasks are created once and never deleted. Status changes go through
//! [`TaskRegistry::transition`], which enforces [`TaskStatus::can_transition_to`].

mod status;

pub use status::TaskStatus;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::RegistryError;
use crate::store::DocumentStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub objective: String,
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub thread_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub objective: String,
    pub workspace_path: PathBuf,
    pub branch_name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskDocument {
    pub tasks: BTreeMap<String, Task>,
}

pub struct TaskRegistry {
    store: DocumentStore<TaskDocument>,
    // Serializes load-modify-save within this process.
    write_lock: Mutex<()>,
}

impl TaskRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: DocumentStore::new(path),
            write_lock: Mutex::new(()),
        }
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut TaskDocument) -> Result<R, RegistryError>,
    ) -> Result<R, RegistryError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.store.update(f)
    }

    /// Register a new task in `created`. Fails if the id exists or the branch
    /// is bound to another task.
    pub fn create(&self, new: NewTask) -> Result<Task, RegistryError> {
        let task = self.mutate(|doc| {
            if doc.tasks.contains_key(&new.id) {
                return Err(RegistryError::DuplicateTask { id: new.id.clone() });
            }
            if let Some(owner) = doc.tasks.values().find(|t| t.branch_name == new.branch_name) {
                return Err(RegistryError::BranchInUse {
                    branch: new.branch_name.clone(),
                    owner: owner.id.clone(),
                });
            }
            let now = Utc::now();
            let task = Task {
                id: new.id,
                objective: new.objective,
                workspace_path: new.workspace_path,
                branch_name: new.branch_name,
                thread_id: None,
                status: TaskStatus::Created,
                created_at: now,
                updated_at: now,
                last_error: None,
            };
            doc.tasks.insert(task.id.clone(), task.clone());
            Ok(task)
        })?;
        info!(task_id = %task.id, branch = %task.branch_name, "task created");
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>, RegistryError> {
        Ok(self.store.load()?.tasks.remove(id))
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Result<Vec<Task>, RegistryError> {
        let mut tasks: Vec<Task> = self.store.load()?.tasks.into_values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub fn find_by_branch(&self, branch: &str) -> Result<Option<Task>, RegistryError> {
        Ok(self
            .store
            .load()?
            .tasks
            .into_values()
            .find(|t| t.branch_name == branch))
    }

    /// Move a task to `to`. A same-state move is a no-op that still succeeds.
    /// `error` is recorded as `last_error` when moving to `failed`.
    pub fn transition(
        &self,
        id: &str,
        to: TaskStatus,
        error: Option<String>,
    ) -> Result<Task, RegistryError> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(id)
                .ok_or_else(|| RegistryError::TaskNotFound { id: id.to_string() })?;
            let from = task.status;
            if !from.can_transition_to(to) {
                return Err(RegistryError::IllegalTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            if from != to {
                task.status = to;
                task.updated_at = Utc::now();
                debug!(task_id = %id, %from, %to, "task transition");
            }
            if to == TaskStatus::Failed {
                task.last_error = error;
            } else if from == TaskStatus::Failed {
                task.last_error = None;
            }
            Ok(task.clone())
        })
    }

    pub fn set_thread_id(&self, id: &str, thread_id: &str) -> Result<Task, RegistryError> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(id)
                .ok_or_else(|| RegistryError::TaskNotFound { id: id.to_string() })?;
            task.thread_id = Some(thread_id.to_string());
            task.updated_at = Utc::now();
            Ok(task.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, TaskRegistry) {
        let dir = tempdir().unwrap();
        let registry = TaskRegistry::new(dir.path().join("tasks.json"));
        (dir, registry)
    }

    fn new_task(id: &str, branch: &str) -> NewTask {
        NewTask {
            id: id.to_string(),
            objective: "add a flag".to_string(),
            workspace_path: PathBuf::from("/tmp/ws").join(id),
            branch_name: branch.to_string(),
        }
    }

    fn force_status(registry: &TaskRegistry, id: &str, status: TaskStatus) {
        registry
            .store
            .update(|doc| {
                doc.tasks.get_mut(id).unwrap().status = status;
                Ok::<_, RegistryError>(())
            })
            .unwrap();
    }

    // =========================================
    // create
    // =========================================

    #[test]
    fn create_starts_in_created() {
        let (_dir, registry) = setup();
        let task = registry.create(new_task("t-1", "foreman/t-1")).unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(registry.get("t-1").unwrap(), Some(task));
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let (_dir, registry) = setup();
        registry.create(new_task("t-1", "a")).unwrap();
        let err = registry.create(new_task("t-1", "b")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTask { .. }));
    }

    #[test]
    fn create_rejects_branch_bound_elsewhere() {
        let (_dir, registry) = setup();
        registry.create(new_task("t-1", "shared")).unwrap();
        match registry.create(new_task("t-2", "shared")).unwrap_err() {
            RegistryError::BranchInUse { branch, owner } => {
                assert_eq!(branch, "shared");
                assert_eq!(owner, "t-1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(registry.get("t-2").unwrap().is_none());
    }

    // =========================================
    // transition
    // =========================================

    #[test]
    fn every_legal_edge_succeeds_and_persists() {
        let (_dir, registry) = setup();
        registry.create(new_task("t", "b")).unwrap();
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                if !from.can_transition_to(to) {
                    continue;
                }
                force_status(&registry, "t", from);
                let task = registry.transition("t", to, None).unwrap();
                assert_eq!(task.status, to);
                assert_eq!(registry.get("t").unwrap().unwrap().status, to);
            }
        }
    }

    #[test]
    fn every_illegal_edge_fails_naming_both_states() {
        let (_dir, registry) = setup();
        registry.create(new_task("t", "b")).unwrap();
        let mut checked = 0;
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                force_status(&registry, "t", from);
                let msg = registry.transition("t", to, None).unwrap_err().to_string();
                assert!(msg.contains(from.as_str()), "{}", msg);
                assert!(msg.contains(to.as_str()), "{}", msg);
                assert_eq!(registry.get("t").unwrap().unwrap().status, from);
                checked += 1;
            }
        }
        assert!(checked > 0);
    }

    #[test]
    fn same_state_transition_is_a_no_op() {
        let (_dir, registry) = setup();
        let created = registry.create(new_task("t", "b")).unwrap();
        let same = registry.transition("t", TaskStatus::Created, None).unwrap();
        assert_eq!(same.updated_at, created.updated_at);
    }

    #[test]
    fn failure_reason_is_recorded_and_cleared_on_recovery() {
        let (_dir, registry) = setup();
        registry.create(new_task("t", "b")).unwrap();
        let failed = registry
            .transition("t", TaskStatus::Failed, Some("verify failed".into()))
            .unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("verify failed"));
        let ready = registry.transition("t", TaskStatus::Ready, None).unwrap();
        assert_eq!(ready.last_error, None);
    }

    #[test]
    fn transition_unknown_task_fails() {
        let (_dir, registry) = setup();
        assert!(matches!(
            registry.transition("nope", TaskStatus::Mutating, None),
            Err(RegistryError::TaskNotFound { .. })
        ));
    }

    // =========================================
    // lookups
    // =========================================

    #[test]
    fn thread_id_and_branch_lookup() {
        let (_dir, registry) = setup();
        registry.create(new_task("t-1", "feature/x")).unwrap();
        registry.set_thread_id("t-1", "th-9").unwrap();
        let found = registry.find_by_branch("feature/x").unwrap().unwrap();
        assert_eq!(found.id, "t-1");
        assert_eq!(found.thread_id.as_deref(), Some("th-9"));
        assert!(registry.find_by_branch("feature/y").unwrap().is_none());
    }

    #[test]
    fn list_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        {
            let registry = TaskRegistry::new(&path);
            registry.create(new_task("t-1", "a")).unwrap();
            registry.create(new_task("t-2", "b")).unwrap();
        }
        let reopened = TaskRegistry::new(&path);
        let ids: Vec<_> = reopened.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t-1", "t-2"]);
    }
}
