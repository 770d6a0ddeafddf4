use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::scheduler::resources::Resources;

pub type TaskId = Uuid;
pub type WorkerId = u64;
/// Index of the assignment-log entry that carried an assignment.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Assigned or running: the task holds an assignment.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Assigned => write!(f, "assigned"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a submitter asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub command: String,
    pub resources: Resources,
    /// Number of failures after which the task is failed for good.
    /// Zero means "use the cluster default".
    pub max_retries: u32,
}

impl TaskSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            resources: Resources::new(),
            max_retries: 0,
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The worker stopped heartbeating while holding the task
    WorkerLost,
    /// The worker reported a failed run
    TaskError(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::WorkerLost => write!(f, "worker lost"),
            FailureReason::TaskError(msg) => write!(f, "{}", msg),
        }
    }
}

/// Lifecycle events, always delivered together with the epoch they refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    Started,
    Completed,
    Failed(FailureReason),
    CancelRequested,
    /// Worker confirmed the cancel, or the cancel timed out
    Cancelled,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::Started => write!(f, "started"),
            TaskEvent::Completed => write!(f, "completed"),
            TaskEvent::Failed(reason) => write!(f, "failed ({})", reason),
            TaskEvent::CancelRequested => write!(f, "cancel requested"),
            TaskEvent::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of feeding an event to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// Already applied for this epoch; nothing changed
    Duplicate,
    /// Refers to an older assignment or a finished task; nothing changed
    Stale,
}

/// Immutable record of one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub epoch: Epoch,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub spec: TaskSpec,
    pub state: TaskState,
    pub assigned_worker: Option<WorkerId>,
    /// Epoch of the current (or most recent) assignment, 0 if never assigned
    pub epoch: Epoch,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub cancel_requested: bool,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, spec: TaskSpec, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            state: TaskState::Pending,
            assigned_worker: None,
            epoch: 0,
            retry_count: 0,
            last_error: None,
            cancel_requested: false,
            cancel_requested_at: None,
            submitted_at,
            updated_at: submitted_at,
            finished_at: None,
        }
    }

    fn retry_bound(&self) -> u32 {
        self.spec.max_retries.max(1)
    }

    /// The permanent failure, if the task ran out of retries.
    pub fn failure(&self) -> Option<DispatchError> {
        if self.state == TaskState::Failed && self.retry_count >= self.retry_bound() {
            Some(DispatchError::MaxRetriesExceeded {
                task_id: self.id,
                retries: self.retry_count,
            })
        } else {
            None
        }
    }

    /// Give the task to `worker_id` under a fresh epoch.
    pub fn assign(
        &mut self,
        worker_id: WorkerId,
        epoch: Epoch,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        if self.state.is_active() && self.epoch == epoch && self.assigned_worker == Some(worker_id)
        {
            return Ok(Transition::Duplicate);
        }
        if epoch <= self.epoch || self.state.is_terminal() {
            return Ok(Transition::Stale);
        }
        if self.state != TaskState::Pending {
            return Err(self.invalid("assign"));
        }

        self.state = TaskState::Assigned;
        self.assigned_worker = Some(worker_id);
        self.epoch = epoch;
        self.updated_at = at;
        Ok(Transition::Applied)
    }

    /// Apply a lifecycle event for assignment `epoch`.
    pub fn apply_event(
        &mut self,
        epoch: Epoch,
        event: &TaskEvent,
        at: DateTime<Utc>,
    ) -> Result<Transition> {
        if epoch != self.epoch {
            return Ok(Transition::Stale);
        }

        let transition = match event {
            TaskEvent::Started => match self.state {
                TaskState::Running => Transition::Duplicate,
                TaskState::Assigned => {
                    self.state = TaskState::Running;
                    Transition::Applied
                }
                TaskState::Pending if self.epoch == 0 => return Err(self.invalid(event)),
                _ => Transition::Stale,
            },
            TaskEvent::Completed => match self.state {
                TaskState::Completed => Transition::Duplicate,
                TaskState::Assigned | TaskState::Running => {
                    self.finish(TaskState::Completed, at);
                    Transition::Applied
                }
                TaskState::Pending if self.epoch == 0 => return Err(self.invalid(event)),
                _ => Transition::Stale,
            },
            TaskEvent::Failed(reason) => match self.state {
                TaskState::Failed => Transition::Duplicate,
                // Already failed and re-queued for this epoch
                TaskState::Pending if self.epoch != 0 => Transition::Duplicate,
                TaskState::Pending => return Err(self.invalid(event)),
                TaskState::Assigned | TaskState::Running if self.cancel_requested => {
                    self.finish(TaskState::Cancelled, at);
                    Transition::Applied
                }
                TaskState::Assigned | TaskState::Running => {
                    self.fail(reason, at);
                    Transition::Applied
                }
                TaskState::Completed | TaskState::Cancelled => Transition::Stale,
            },
            TaskEvent::CancelRequested => match self.state {
                TaskState::Pending => {
                    self.cancel_requested = true;
                    self.cancel_requested_at = Some(at);
                    self.finish(TaskState::Cancelled, at);
                    Transition::Applied
                }
                TaskState::Assigned | TaskState::Running if self.cancel_requested => {
                    Transition::Duplicate
                }
                TaskState::Assigned | TaskState::Running => {
                    self.cancel_requested = true;
                    self.cancel_requested_at = Some(at);
                    Transition::Applied
                }
                TaskState::Cancelled => Transition::Duplicate,
                TaskState::Completed | TaskState::Failed => Transition::Stale,
            },
            TaskEvent::Cancelled => match self.state {
                TaskState::Cancelled => Transition::Duplicate,
                TaskState::Assigned | TaskState::Running if self.cancel_requested => {
                    self.finish(TaskState::Cancelled, at);
                    Transition::Applied
                }
                TaskState::Completed | TaskState::Failed => Transition::Stale,
                _ => return Err(self.invalid(event)),
            },
        };

        if transition == Transition::Applied {
            self.updated_at = at;
        }
        Ok(transition)
    }

    fn fail(&mut self, reason: &FailureReason, at: DateTime<Utc>) {
        self.retry_count += 1;
        if self.retry_count >= self.retry_bound() {
            let err = DispatchError::MaxRetriesExceeded {
                task_id: self.id,
                retries: self.retry_count,
            };
            self.last_error = Some(format!("{}: {}", err, reason));
            self.finish(TaskState::Failed, at);
        } else {
            self.last_error = Some(reason.to_string());
            self.state = TaskState::Pending;
            self.assigned_worker = None;
        }
    }

    fn finish(&mut self, state: TaskState, at: DateTime<Utc>) {
        self.state = state;
        self.finished_at = Some(at);
    }

    fn invalid(&self, event: impl ToString) -> DispatchError {
        DispatchError::InvalidTransition {
            task_id: self.id,
            from: self.state,
            event: event.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(max_retries: u32) -> Task {
        Task::new(
            Uuid::new_v4(),
            TaskSpec::new("echo hi").with_max_retries(max_retries),
            Utc::now(),
        )
    }

    fn fail(t: &mut Task, epoch: Epoch) -> Transition {
        t.apply_event(
            epoch,
            &TaskEvent::Failed(FailureReason::TaskError("boom".into())),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn happy_path() {
        let mut t = task(3);
        assert_eq!(t.assign(1, 5, Utc::now()).unwrap(), Transition::Applied);
        assert_eq!(t.state, TaskState::Assigned);
        assert_eq!(
            t.apply_event(5, &TaskEvent::Started, Utc::now()).unwrap(),
            Transition::Applied
        );
        assert_eq!(t.state, TaskState::Running);
        assert_eq!(
            t.apply_event(5, &TaskEvent::Completed, Utc::now()).unwrap(),
            Transition::Applied
        );
        assert_eq!(t.state, TaskState::Completed);
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn duplicate_events_are_noops() {
        let mut t = task(3);
        t.assign(1, 5, Utc::now()).unwrap();
        assert_eq!(t.assign(1, 5, Utc::now()).unwrap(), Transition::Duplicate);
        t.apply_event(5, &TaskEvent::Started, Utc::now()).unwrap();
        assert_eq!(
            t.apply_event(5, &TaskEvent::Started, Utc::now()).unwrap(),
            Transition::Duplicate
        );
        t.apply_event(5, &TaskEvent::Completed, Utc::now()).unwrap();
        let before = t.clone();
        assert_eq!(
            t.apply_event(5, &TaskEvent::Completed, Utc::now()).unwrap(),
            Transition::Duplicate
        );
        assert_eq!(t, before);
    }

    #[test]
    fn events_for_old_epoch_are_stale() {
        let mut t = task(3);
        t.assign(1, 5, Utc::now()).unwrap();
        assert_eq!(fail(&mut t, 5), Transition::Applied);
        assert_eq!(t.state, TaskState::Pending);
        assert_eq!(t.assigned_worker, None);

        t.assign(2, 9, Utc::now()).unwrap();
        assert_eq!(
            t.apply_event(5, &TaskEvent::Completed, Utc::now()).unwrap(),
            Transition::Stale
        );
        assert_eq!(t.state, TaskState::Assigned);
        assert_eq!(t.assigned_worker, Some(2));
    }

    #[test]
    fn failure_is_idempotent_per_epoch() {
        let mut t = task(3);
        t.assign(1, 5, Utc::now()).unwrap();
        assert_eq!(fail(&mut t, 5), Transition::Applied);
        assert_eq!(fail(&mut t, 5), Transition::Duplicate);
        assert_eq!(t.retry_count, 1);
    }

    #[test]
    fn third_failure_exhausts_bound_of_three() {
        let mut t = task(3);
        for (i, (worker, epoch)) in [(1, 10), (2, 20), (3, 30)].into_iter().enumerate() {
            assert_eq!(t.state, TaskState::Pending);
            t.assign(worker, epoch, Utc::now()).unwrap();
            fail(&mut t, epoch);
            assert_eq!(t.retry_count, i as u32 + 1);
        }
        assert_eq!(t.state, TaskState::Failed);
        assert!(matches!(
            t.failure(),
            Some(DispatchError::MaxRetriesExceeded { retries: 3, .. })
        ));
        assert!(t.last_error.unwrap().contains("retry bound"));
    }

    #[test]
    fn cancel_pending_is_immediate() {
        let mut t = task(3);
        assert_eq!(
            t.apply_event(0, &TaskEvent::CancelRequested, Utc::now())
                .unwrap(),
            Transition::Applied
        );
        assert_eq!(t.state, TaskState::Cancelled);
    }

    #[test]
    fn cancel_running_waits_for_confirmation() {
        let mut t = task(3);
        t.assign(1, 4, Utc::now()).unwrap();
        t.apply_event(4, &TaskEvent::Started, Utc::now()).unwrap();
        t.apply_event(4, &TaskEvent::CancelRequested, Utc::now())
            .unwrap();
        assert_eq!(t.state, TaskState::Running);
        assert!(t.cancel_requested);
        assert_eq!(
            t.apply_event(4, &TaskEvent::CancelRequested, Utc::now())
                .unwrap(),
            Transition::Duplicate
        );
        t.apply_event(4, &TaskEvent::Cancelled, Utc::now()).unwrap();
        assert_eq!(t.state, TaskState::Cancelled);
    }

    #[test]
    fn completion_before_cancel_confirmation_wins() {
        let mut t = task(3);
        t.assign(1, 4, Utc::now()).unwrap();
        t.apply_event(4, &TaskEvent::CancelRequested, Utc::now())
            .unwrap();
        t.apply_event(4, &TaskEvent::Completed, Utc::now()).unwrap();
        assert_eq!(t.state, TaskState::Completed);
        assert_eq!(
            t.apply_event(4, &TaskEvent::Cancelled, Utc::now()).unwrap(),
            Transition::Stale
        );
    }

    #[test]
    fn worker_loss_during_cancel_resolves_cancelled() {
        let mut t = task(3);
        t.assign(1, 4, Utc::now()).unwrap();
        t.apply_event(4, &TaskEvent::CancelRequested, Utc::now())
            .unwrap();
        t.apply_event(
            4,
            &TaskEvent::Failed(FailureReason::WorkerLost),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.state, TaskState::Cancelled);
        assert_eq!(t.retry_count, 0);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut t = task(3);
        assert!(matches!(
            t.apply_event(0, &TaskEvent::Completed, Utc::now()),
            Err(DispatchError::InvalidTransition { .. })
        ));
        t.assign(1, 4, Utc::now()).unwrap();
        assert!(t.apply_event(4, &TaskEvent::Cancelled, Utc::now()).is_err());
        assert_eq!(t.state, TaskState::Assigned);
    }

    #[test]
    fn assign_requires_newer_epoch() {
        let mut t = task(3);
        t.assign(1, 4, Utc::now()).unwrap();
        fail(&mut t, 4);
        assert_eq!(t.assign(2, 3, Utc::now()).unwrap(), Transition::Stale);
        assert_eq!(t.state, TaskState::Pending);
    }
}
