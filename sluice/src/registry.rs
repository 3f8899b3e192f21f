//! Concurrent task registry.

use dashmap::DashMap;
use tracing::debug;

use crate::task::{DownloadTask, TaskStatus};

/// Concurrent map of every known task, keyed by task id.
///
/// All reads hand out owned snapshots; mutation goes through [`Self::update`]
/// or [`Self::transition`] so each change is atomic with respect to other
/// callers and observers never see a task mid-update.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, DownloadTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Register a task under its id.
    pub fn insert(&self, task: DownloadTask) {
        self.tasks.insert(task.id.clone(), task);
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    /// Atomic read-modify-write. Returns the post-update snapshot; `None` for
    /// unknown ids (updates against removed tasks are silent no-ops).
    pub fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut DownloadTask),
    ) -> Option<DownloadTask> {
        let mut entry = self.tasks.get_mut(id)?;
        mutate(entry.value_mut());
        Some(entry.value().clone())
    }

    /// Validated status change.
    ///
    /// Returns `None` when the id is unknown or the transition is illegal;
    /// illegal transitions are logged at debug and otherwise ignored.
    pub fn transition(&self, id: &str, next: TaskStatus) -> Option<DownloadTask> {
        self.transition_with(id, next, |_| {})
    }

    /// Validated status change that additionally requires the current state.
    ///
    /// `Waiting -> Downloading` is the admission edge as well as the resume
    /// edge; callers that mean only one of them pass the `from` state they
    /// expect. Returns `None` when the id is unknown, the task is not in
    /// `from`, or the transition is illegal.
    pub fn transition_from(
        &self,
        id: &str,
        from: TaskStatus,
        next: TaskStatus,
    ) -> Option<DownloadTask> {
        let mut entry = self.tasks.get_mut(id)?;
        let current = entry.value().status;
        if current != from || !current.can_transition_to(next) {
            debug!(
                task_id = %id,
                from = %current,
                expected = %from,
                to = %next,
                "ignoring status transition outside expected state"
            );
            return None;
        }
        let task = entry.value_mut();
        task.status = next;
        Some(entry.value().clone())
    }

    /// Validated status change plus extra mutation under the same entry lock.
    pub fn transition_with(
        &self,
        id: &str,
        next: TaskStatus,
        mutate: impl FnOnce(&mut DownloadTask),
    ) -> Option<DownloadTask> {
        let mut entry = self.tasks.get_mut(id)?;
        let current = entry.value().status;
        if !current.can_transition_to(next) {
            debug!(
                task_id = %id,
                from = %current,
                to = %next,
                "ignoring illegal status transition"
            );
            return None;
        }
        let task = entry.value_mut();
        task.status = next;
        mutate(task);
        Some(entry.value().clone())
    }

    /// Snapshots of all tasks, oldest first.
    pub fn list(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Remove a task; `true` when it existed.
    pub fn remove(&self, id: &str) -> bool {
        self.tasks.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
