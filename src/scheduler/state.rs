use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::raft::state::{Command, LogEntry};
use crate::scheduler::resources::Resources;
use crate::scheduler::task::{AssignmentRecord, Task, TaskId, TaskState, Transition, WorkerId};

/// Task table and assignment history, built only by applying committed log
/// entries in order.
///
/// Every replica that applies the same prefix of the log ends up with an
/// equal `ClusterState`, which is what lets a new leader pick up where the
/// old one stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterState {
    tasks: HashMap<TaskId, Task>,
    assignments: Vec<AssignmentRecord>,
    last_applied: u64,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from scratch out of log entries.
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut state = Self::new();
        for entry in entries {
            state.apply(entry);
        }
        state
    }

    /// Apply one committed entry. Entries at or below `last_applied` are
    /// skipped, so applying a log twice is harmless.
    pub fn apply(&mut self, entry: &LogEntry) -> Option<Transition> {
        if entry.index <= self.last_applied {
            return None;
        }
        self.last_applied = entry.index;

        match &entry.command {
            Command::SubmitTask {
                task_id,
                spec,
                submitted_at,
            } => {
                if self.tasks.contains_key(task_id) {
                    return Some(Transition::Duplicate);
                }
                self.tasks
                    .insert(*task_id, Task::new(*task_id, spec.clone(), *submitted_at));
                tracing::debug!(
                    task_id = %task_id,
                    index = entry.index,
                    "Task added from committed entry"
                );
                Some(Transition::Applied)
            }
            Command::Assign {
                task_id,
                worker_id,
                assigned_at,
            } => {
                let task = self.known_task(task_id, entry.index)?;
                let epoch = entry.index;
                match task.assign(*worker_id, epoch, *assigned_at) {
                    Ok(Transition::Applied) => {
                        self.assignments.push(AssignmentRecord {
                            task_id: *task_id,
                            worker_id: *worker_id,
                            epoch,
                            timestamp: *assigned_at,
                        });
                        Some(Transition::Applied)
                    }
                    Ok(other) => Some(other),
                    Err(e) => {
                        tracing::warn!(error = %e, epoch, "Ignoring assignment");
                        None
                    }
                }
            }
            Command::TaskEvent {
                task_id,
                epoch,
                event,
                at,
            } => {
                let task = self.known_task(task_id, entry.index)?;
                match task.apply_event(*epoch, event, *at) {
                    Ok(transition) => {
                        if transition == Transition::Applied {
                            tracing::debug!(
                                task_id = %task_id,
                                epoch,
                                event = %event,
                                state = %task.state,
                                "Task transition applied"
                            );
                        }
                        Some(transition)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, epoch, "Ignoring task event");
                        None
                    }
                }
            }
            Command::Purge { task_ids } => {
                for id in task_ids {
                    if self.tasks.get(id).is_some_and(|t| t.state.is_terminal()) {
                        self.tasks.remove(id);
                    }
                }
                Some(Transition::Applied)
            }
            Command::Noop => None,
        }
    }

    fn known_task(&mut self, task_id: &TaskId, index: u64) -> Option<&mut Task> {
        let task = self.tasks.get_mut(task_id);
        if task.is_none() {
            tracing::warn!(task_id = %task_id, index, "Log entry refers to unknown task");
        }
        task
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// All tasks in submission order
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.submitted_at, t.id));
        tasks
    }

    /// Pending tasks in submission order
    pub fn pending_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .collect();
        tasks.sort_by_key(|t| (t.submitted_at, t.id));
        tasks
    }

    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }

    /// Tasks currently assigned to or running on `worker_id`
    pub fn active_tasks_for(&self, worker_id: WorkerId) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.state.is_active() && t.assigned_worker == Some(worker_id))
            .collect();
        tasks.sort_by_key(|t| t.epoch);
        tasks
    }

    /// Workers that hold at least one active task
    pub fn workers_with_active_tasks(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .tasks
            .values()
            .filter(|t| t.state.is_active())
            .filter_map(|t| t.assigned_worker)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Resources held by the active tasks of `worker_id`
    pub fn allocated(&self, worker_id: WorkerId) -> Resources {
        let mut total = Resources::new();
        for task in self.active_tasks_for(worker_id) {
            total.accumulate(&task.spec.resources);
        }
        total
    }

    pub fn assignments(&self) -> &[AssignmentRecord] {
        &self.assignments
    }

    /// The record backing a task's current assignment, if it holds one
    pub fn active_assignment(&self, task_id: &TaskId) -> Option<&AssignmentRecord> {
        let task = self.tasks.get(task_id)?;
        if !task.state.is_active() {
            return None;
        }
        self.assignments
            .iter()
            .rev()
            .find(|r| r.task_id == *task_id && r.epoch == task.epoch)
    }

    /// Active assignments by task, the view a scheduler needs after restart
    pub fn active_assignments(&self) -> BTreeMap<TaskId, AssignmentRecord> {
        self.tasks
            .keys()
            .filter_map(|id| self.active_assignment(id).map(|r| (*id, r.clone())))
            .collect()
    }

    /// Terminal tasks that finished before `cutoff`
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state.is_terminal() && t.finished_at.is_some_and(|at| at < cutoff))
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Active tasks whose cancel was requested before `cutoff`
    pub fn cancels_requested_before(&self, cutoff: DateTime<Utc>) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| {
                t.state.is_active()
                    && t.cancel_requested_at.is_some_and(|at| at < cutoff)
            })
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<TaskState, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
