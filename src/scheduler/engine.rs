use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{DispatchError, Result};
use crate::raft::{Command, RaftNode, RaftStatus};
use crate::scheduler::placement::{self, Candidate};
use crate::scheduler::resources::Resources;
use crate::scheduler::state::ClusterState;
use crate::scheduler::task::{
    Epoch, FailureReason, Task, TaskEvent, TaskId, TaskSpec, TaskState, Transition, WorkerId,
};
use crate::scheduler::tracker::HeartbeatTracker;

/// A lifecycle report from a worker about one assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub epoch: Epoch,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn new(task_id: TaskId, epoch: Epoch) -> Self {
        Self {
            task_id,
            epoch,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Everything a worker sends in one heartbeat
#[derive(Debug, Clone, Default)]
pub struct HeartbeatReport {
    pub worker_id: WorkerId,
    pub capacity: Resources,
    pub started: Vec<TaskReport>,
    pub completed: Vec<TaskReport>,
    pub failed: Vec<TaskReport>,
    pub cancelled: Vec<TaskReport>,
}

impl HeartbeatReport {
    pub fn new(worker_id: WorkerId, capacity: Resources) -> Self {
        Self {
            worker_id,
            capacity,
            ..Default::default()
        }
    }
}

/// A committed assignment, as announced to its worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub epoch: Epoch,
    pub spec: TaskSpec,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatReply {
    pub assignments: Vec<Assignment>,
    /// Assignments the worker should stop
    pub cancellations: Vec<(TaskId, Epoch)>,
    pub leader_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub task_id: TaskId,
    /// Log index of the submission
    pub epoch: Epoch,
}

#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub capacity: Resources,
    pub spare: Resources,
    pub task_ids: Vec<TaskId>,
    pub last_heartbeat_age: Duration,
}

#[derive(Debug, Clone)]
pub struct StateSummary {
    pub raft: RaftStatus,
    pub live_workers: Vec<WorkerId>,
    pub counts: BTreeMap<TaskState, usize>,
}

/// Requests handled by the scheduler loop, each with its reply channel
#[derive(Debug)]
pub enum SchedulerEvent {
    Submit {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<SubmitReceipt>>,
    },
    Heartbeat {
        report: HeartbeatReport,
        reply: oneshot::Sender<Result<HeartbeatReply>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<Task>>,
    },
    TaskStatus {
        task_id: TaskId,
        reply: oneshot::Sender<Result<Task>>,
    },
    WorkerStatus {
        worker_id: WorkerId,
        reply: oneshot::Sender<Result<WorkerStatus>>,
    },
    ListTasks {
        reply: oneshot::Sender<Vec<Task>>,
    },
    Summary {
        reply: oneshot::Sender<StateSummary>,
    },
}

/// Create the bounded queue feeding a scheduler loop
pub fn event_channel(capacity: usize) -> (SchedulerHandle, mpsc::Receiver<SchedulerEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SchedulerHandle { tx }, rx)
}

/// Cloneable front door to the scheduler loop
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerEvent,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.try_send(make(reply)).map_err(|e| match e {
            TrySendError::Full(_) => DispatchError::Overloaded {
                pending: self.tx.max_capacity(),
                limit: self.tx.max_capacity(),
            },
            TrySendError::Closed(_) => DispatchError::Unavailable("scheduler stopped".to_string()),
        })?;
        rx.await
            .map_err(|_| DispatchError::Unavailable("scheduler dropped the request".to_string()))
    }

    pub async fn submit(&self, spec: TaskSpec) -> Result<SubmitReceipt> {
        self.request(|reply| SchedulerEvent::Submit { spec, reply })
            .await?
    }

    pub async fn heartbeat(&self, report: HeartbeatReport) -> Result<HeartbeatReply> {
        self.request(|reply| SchedulerEvent::Heartbeat { report, reply })
            .await?
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<Task> {
        self.request(|reply| SchedulerEvent::Cancel { task_id, reply })
            .await?
    }

    pub async fn task_status(&self, task_id: TaskId) -> Result<Task> {
        self.request(|reply| SchedulerEvent::TaskStatus { task_id, reply })
            .await?
    }

    pub async fn worker_status(&self, worker_id: WorkerId) -> Result<WorkerStatus> {
        self.request(|reply| SchedulerEvent::WorkerStatus { worker_id, reply })
            .await?
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.request(|reply| SchedulerEvent::ListTasks { reply }).await
    }

    pub async fn summary(&self) -> Result<StateSummary> {
        self.request(|reply| SchedulerEvent::Summary { reply }).await
    }
}

/// The single writer of cluster state.
///
/// Every replica runs one. Followers only apply committed entries and answer
/// reads; the leader also takes decisions, and every decision goes through
/// the assignment log before anyone hears about it.
pub struct Scheduler {
    raft: Arc<RaftNode>,
    config: SchedulerConfig,
    state: ClusterState,
    tracker: HeartbeatTracker,
    was_leader: bool,
}

impl Scheduler {
    pub fn new(raft: Arc<RaftNode>, config: SchedulerConfig) -> Self {
        let tracker = HeartbeatTracker::new(config.liveness_timeout());
        Self {
            raft,
            config,
            state: ClusterState::new(),
            tracker,
            was_leader: false,
        }
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn tracker(&self) -> &HeartbeatTracker {
        &self.tracker
    }

    /// Run the decision loop until `shutdown` fires or every handle is gone
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SchedulerEvent>,
        shutdown: CancellationToken,
    ) {
        let mut commits = self.raft.subscribe_commits();
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(node_id = self.raft.id, "Scheduler loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.raft.id, "Scheduler loop shutting down");
                    break;
                }

                changed = commits.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_committed().await;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Submit { spec, reply } => {
                let _ = reply.send(self.submit(spec).await);
            }
            SchedulerEvent::Heartbeat { report, reply } => {
                let _ = reply.send(self.heartbeat(report, Instant::now()).await);
            }
            SchedulerEvent::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(task_id).await);
            }
            SchedulerEvent::TaskStatus { task_id, reply } => {
                let _ = reply.send(self.task_status(task_id).await);
            }
            SchedulerEvent::WorkerStatus { worker_id, reply } => {
                let _ = reply.send(self.worker_status(worker_id, Instant::now()).await);
            }
            SchedulerEvent::ListTasks { reply } => {
                self.apply_committed().await;
                let _ = reply.send(self.state.tasks().into_iter().cloned().collect());
            }
            SchedulerEvent::Summary { reply } => {
                let _ = reply.send(self.summary(Instant::now()).await);
            }
        }
    }

    /// Apply every newly committed log entry to the task table
    pub async fn apply_committed(&mut self) {
        for entry in self.raft.committed_entries_after(self.state.last_applied()).await {
            self.state.apply(&entry);
        }
    }

    /// Propose a command and wait for it to be durable, then apply it
    async fn commit(&mut self, command: Command) -> Result<Epoch> {
        let index = self
            .raft
            .propose(command, self.config.quorum_timeout())
            .await?;
        self.apply_committed().await;
        Ok(index)
    }

    async fn ensure_leader(&self) -> Result<()> {
        if self.raft.is_leader().await {
            Ok(())
        } else {
            Err(DispatchError::NotLeader(self.raft.get_leader_id().await))
        }
    }

    pub async fn submit(&mut self, mut spec: TaskSpec) -> Result<SubmitReceipt> {
        self.ensure_leader().await?;

        if spec.command.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        if spec.max_retries == 0 {
            spec.max_retries = self.config.max_retries;
        }

        self.apply_committed().await;
        let pending = self.state.pending_count();
        if pending >= self.config.max_pending_tasks {
            tracing::warn!(pending, limit = self.config.max_pending_tasks, "Rejecting submission");
            return Err(DispatchError::Overloaded {
                pending,
                limit: self.config.max_pending_tasks,
            });
        }

        let task_id = Uuid::new_v4();
        let epoch = self
            .commit(Command::SubmitTask {
                task_id,
                spec,
                submitted_at: Utc::now(),
            })
            .await?;

        tracing::info!(task_id = %task_id, epoch, "Task submitted");
        Ok(SubmitReceipt { task_id, epoch })
    }

    /// Record a heartbeat, commit the lifecycle events it carries, place
    /// pending work and answer with the worker's committed assignments.
    pub async fn heartbeat(
        &mut self,
        report: HeartbeatReport,
        now: Instant,
    ) -> Result<HeartbeatReply> {
        self.ensure_leader().await?;
        self.apply_committed().await;

        let worker_id = report.worker_id;
        self.tracker
            .record_heartbeat(worker_id, report.capacity.clone(), now);
        tracing::trace!(worker_id, "Heartbeat");

        let events = report
            .started
            .iter()
            .map(|r| (r, TaskEvent::Started))
            .chain(report.completed.iter().map(|r| (r, TaskEvent::Completed)))
            .chain(report.failed.iter().map(|r| {
                let message = r.error.clone().unwrap_or_else(|| "task failed".to_string());
                (r, TaskEvent::Failed(FailureReason::TaskError(message)))
            }))
            .chain(report.cancelled.iter().map(|r| (r, TaskEvent::Cancelled)));

        for (task_report, event) in events {
            self.record_event(worker_id, task_report, event).await?;
        }

        if let Err(e) = self.schedule_pending(now).await {
            tracing::warn!(error = %e, "Placement pass stopped");
        }

        Ok(self.reply_for(worker_id).await)
    }

    async fn record_event(
        &mut self,
        worker_id: WorkerId,
        report: &TaskReport,
        event: TaskEvent,
    ) -> Result<()> {
        let Some(task) = self.state.task(&report.task_id) else {
            tracing::debug!(task_id = %report.task_id, worker_id, "Report for unknown task");
            return Ok(());
        };
        if task.epoch != report.epoch || task.assigned_worker != Some(worker_id) {
            tracing::debug!(
                task_id = %report.task_id,
                epoch = report.epoch,
                worker_id,
                "Ignoring stale report"
            );
            return Ok(());
        }

        // Only changes go to the log
        let mut trial = task.clone();
        match trial.apply_event(report.epoch, &event, Utc::now()) {
            Ok(Transition::Applied) => {}
            Ok(transition) => {
                tracing::debug!(
                    task_id = %report.task_id,
                    epoch = report.epoch,
                    ?transition,
                    "Report changes nothing"
                );
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, worker_id, "Rejected report");
                return Ok(());
            }
        }

        self.commit(Command::TaskEvent {
            task_id: report.task_id,
            epoch: report.epoch,
            event: event.clone(),
            at: Utc::now(),
        })
        .await?;

        if let Some(task) = self.state.task(&report.task_id) {
            match task.state {
                TaskState::Failed => tracing::warn!(
                    task_id = %task.id,
                    retries = task.retry_count,
                    error = task.last_error.as_deref().unwrap_or(""),
                    "Task failed permanently"
                ),
                TaskState::Pending => tracing::info!(
                    task_id = %task.id,
                    retry_count = task.retry_count,
                    "Task will be retried"
                ),
                state => tracing::info!(
                    task_id = %task.id,
                    epoch = task.epoch,
                    worker_id,
                    %state,
                    "Task {}",
                    event
                ),
            }
        }
        Ok(())
    }

    async fn reply_for(&self, worker_id: WorkerId) -> HeartbeatReply {
        let tasks = self.state.active_tasks_for(worker_id);
        let assignments = tasks
            .iter()
            .filter(|t| t.state == TaskState::Assigned && !t.cancel_requested)
            .map(|t| Assignment {
                task_id: t.id,
                epoch: t.epoch,
                spec: t.spec.clone(),
            })
            .collect();
        let cancellations = tasks
            .iter()
            .filter(|t| t.cancel_requested)
            .map(|t| (t.id, t.epoch))
            .collect();

        HeartbeatReply {
            assignments,
            cancellations,
            leader_id: Some(self.raft.id),
        }
    }

    /// Place pending tasks on live workers, committing one `Assign` per
    /// decision. Stops at the first proposal that fails.
    pub async fn schedule_pending(&mut self, now: Instant) -> Result<usize> {
        let candidates: Vec<Candidate> = self
            .tracker
            .list_live_workers(now)
            .into_iter()
            .filter_map(|id| self.tracker.worker(id))
            .filter(|w| !w.adopted)
            .map(|w| Candidate {
                worker_id: w.id,
                capacity: w.capacity.clone(),
                spare: w.capacity.saturating_sub(&self.state.allocated(w.id)),
            })
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let decisions = placement::plan(&self.state.pending_tasks(), candidates);
        let mut placed = 0;
        for (task_id, worker_id) in decisions {
            let epoch = self
                .commit(Command::Assign {
                    task_id,
                    worker_id,
                    assigned_at: Utc::now(),
                })
                .await?;
            tracing::info!(task_id = %task_id, worker_id, epoch, "Task assigned");
            placed += 1;
        }
        Ok(placed)
    }

    /// Periodic housekeeping: leadership changes, worker expiry, cancel
    /// timeouts, placement and retention.
    pub async fn tick(&mut self, now: Instant) {
        self.apply_committed().await;

        let is_leader = self.raft.is_leader().await;
        if !is_leader {
            if self.was_leader {
                tracing::info!(node_id = self.raft.id, "Lost leadership, dropping worker state");
                self.tracker.clear();
            }
            self.was_leader = false;
            return;
        }
        if !self.was_leader {
            // Workers holding tasks get one liveness window to check in
            let holders = self.state.workers_with_active_tasks();
            tracing::info!(node_id = self.raft.id, workers = holders.len(), "Took over scheduling");
            for worker_id in holders {
                self.tracker.adopt(worker_id, now);
            }
            self.was_leader = true;
        }

        if let Err(e) = self.housekeeping(now).await {
            tracing::warn!(error = %e, "Scheduler tick incomplete");
        }
    }

    async fn housekeeping(&mut self, now: Instant) -> Result<()> {
        for worker_id in self.tracker.expire(now) {
            tracing::warn!(worker_id, "Worker expired");
        }

        // Derived from committed state each tick, so tasks whose failure could
        // not be committed last time are picked up again.
        let orphaned: Vec<WorkerId> = self
            .state
            .workers_with_active_tasks()
            .into_iter()
            .filter(|id| !self.tracker.is_live(*id, now))
            .collect();
        for worker_id in orphaned {
            let lost: Vec<(TaskId, Epoch)> = self
                .state
                .active_tasks_for(worker_id)
                .iter()
                .map(|t| (t.id, t.epoch))
                .collect();
            tracing::warn!(worker_id, tasks = lost.len(), "Rescheduling tasks of lost worker");
            for (task_id, epoch) in lost {
                self.commit(Command::TaskEvent {
                    task_id,
                    epoch,
                    event: TaskEvent::Failed(FailureReason::WorkerLost),
                    at: Utc::now(),
                })
                .await?;
            }
        }

        let wall = Utc::now();
        let cancel_cutoff =
            wall - chrono::Duration::milliseconds(self.config.cancel_timeout_ms as i64);
        let timed_out: Vec<(TaskId, Epoch)> = self
            .state
            .cancels_requested_before(cancel_cutoff)
            .iter()
            .map(|t| (t.id, t.epoch))
            .collect();
        for (task_id, epoch) in timed_out {
            tracing::info!(task_id = %task_id, epoch, "Cancel timed out");
            self.commit(Command::TaskEvent {
                task_id,
                epoch,
                event: TaskEvent::Cancelled,
                at: Utc::now(),
            })
            .await?;
        }

        self.schedule_pending(now).await?;

        let retention_cutoff =
            wall - chrono::Duration::milliseconds(self.config.retention_ms as i64);
        let expired = self.state.finished_before(retention_cutoff);
        if !expired.is_empty() {
            tracing::debug!(tasks = expired.len(), "Purging finished tasks");
            self.commit(Command::Purge { task_ids: expired }).await?;
        }
        Ok(())
    }

    /// Request cancellation. Pending tasks cancel at once; assigned or
    /// running ones are told to stop on their worker's next heartbeat.
    pub async fn cancel(&mut self, task_id: TaskId) -> Result<Task> {
        self.ensure_leader().await?;
        self.apply_committed().await;

        let task = self
            .state
            .task(&task_id)
            .ok_or(DispatchError::UnknownTask(task_id))?;
        if task.state.is_terminal() || task.cancel_requested {
            return Ok(task.clone());
        }

        let epoch = task.epoch;
        self.commit(Command::TaskEvent {
            task_id,
            epoch,
            event: TaskEvent::CancelRequested,
            at: Utc::now(),
        })
        .await?;
        tracing::info!(task_id = %task_id, epoch, "Cancel requested");

        self.state
            .task(&task_id)
            .cloned()
            .ok_or(DispatchError::UnknownTask(task_id))
    }

    /// Committed view of one task; answered by any replica
    pub async fn task_status(&mut self, task_id: TaskId) -> Result<Task> {
        self.apply_committed().await;
        self.state
            .task(&task_id)
            .cloned()
            .ok_or(DispatchError::UnknownTask(task_id))
    }

    /// Liveness is only tracked by the leader
    pub async fn worker_status(
        &mut self,
        worker_id: WorkerId,
        now: Instant,
    ) -> Result<WorkerStatus> {
        self.ensure_leader().await?;
        self.apply_committed().await;

        let worker = self
            .tracker
            .worker(worker_id)
            .filter(|w| w.is_alive(now, self.tracker.liveness_timeout()))
            .ok_or(DispatchError::UnknownWorker(worker_id))?;

        Ok(WorkerStatus {
            worker_id,
            capacity: worker.capacity.clone(),
            spare: worker
                .capacity
                .saturating_sub(&self.state.allocated(worker_id)),
            task_ids: self
                .state
                .active_tasks_for(worker_id)
                .iter()
                .map(|t| t.id)
                .collect(),
            last_heartbeat_age: now.saturating_duration_since(worker.last_heartbeat),
        })
    }

    pub async fn summary(&mut self, now: Instant) -> StateSummary {
        self.apply_committed().await;
        StateSummary {
            raft: self.raft.status().await,
            live_workers: self.tracker.list_live_workers(now),
            counts: self.state.counts(),
        }
    }
}
