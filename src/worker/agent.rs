use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Code;

use crate::config::WorkerConfig;
use crate::error::{DispatchError, Result};
use crate::grpc::convert::{heartbeat_to_proto, reply_from_proto};
use crate::proto::dispatch_service_client::DispatchServiceClient;
use crate::scheduler::{Assignment, Epoch, HeartbeatReply, HeartbeatReport, TaskId, TaskReport};
use crate::worker::executor::{ExecutionResult, TaskExecutor};

struct RunningTask {
    epoch: Epoch,
    handle: JoinHandle<()>,
}

/// Worker side of the heartbeat protocol.
///
/// Each heartbeat carries the reports gathered since the last successful one;
/// reports are only dropped once a control-plane replica has accepted them.
/// Assignments arrive in the reply and run as local processes.
pub struct WorkerAgent {
    config: WorkerConfig,
    executor: TaskExecutor,
    client: Option<DispatchServiceClient<Channel>>,
    server_idx: usize,
    outbox: HeartbeatReport,
    running: HashMap<TaskId, RunningTask>,
    /// Assignments already started, as of the last reply
    seen: HashSet<(TaskId, Epoch)>,
    results_tx: mpsc::UnboundedSender<ExecutionResult>,
    results_rx: mpsc::UnboundedReceiver<ExecutionResult>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let outbox = HeartbeatReport::new(config.worker_id, config.capacity.clone());
        Self {
            config,
            executor: TaskExecutor::new(),
            client: None,
            server_idx: 0,
            outbox,
            running: HashMap::new(),
            seen: HashSet::new(),
            results_tx,
            results_rx,
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.config.worker_id
    }

    /// Tasks currently executing here
    pub fn running_tasks(&self) -> Vec<(TaskId, Epoch)> {
        self.running.iter().map(|(id, t)| (*id, t.epoch)).collect()
    }

    /// Heartbeat until `shutdown` fires; running tasks are killed on exit
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            worker_id = self.config.worker_id,
            capacity = %self.config.capacity,
            "Worker agent started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        tracing::warn!(
                            worker_id = self.config.worker_id,
                            error = %e,
                            "Heartbeat failed"
                        );
                    }
                }
            }
        }

        for (task_id, task) in self.running.drain() {
            tracing::info!(task_id = %task_id, epoch = task.epoch, "Stopping task on shutdown");
            task.handle.abort();
        }
    }

    /// Send one heartbeat with everything gathered so far and act on the reply
    pub async fn heartbeat_once(&mut self) -> Result<HeartbeatReply> {
        self.collect_results();

        let request = heartbeat_to_proto(&self.outbox);
        let mut client = self.client().await?;
        let reply = match client.heartbeat(request).await {
            Ok(response) => reply_from_proto(&response.into_inner())?,
            Err(status) => {
                if matches!(status.code(), Code::FailedPrecondition | Code::Unavailable) {
                    self.rotate_server();
                }
                return Err(status.into());
            }
        };

        self.outbox = HeartbeatReport::new(self.config.worker_id, self.config.capacity.clone());
        self.handle_reply(&reply);
        Ok(reply)
    }

    async fn client(&mut self) -> Result<DispatchServiceClient<Channel>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let addr = self
            .config
            .servers
            .get(self.server_idx)
            .cloned()
            .ok_or_else(|| {
                DispatchError::InvalidArgument("no control-plane servers configured".to_string())
            })?;

        match DispatchServiceClient::connect(addr.clone()).await {
            Ok(client) => {
                tracing::debug!(
                    worker_id = self.config.worker_id,
                    server = %addr,
                    "Connected to control plane"
                );
                self.client = Some(client.clone());
                Ok(client)
            }
            Err(e) => {
                self.rotate_server();
                Err(e.into())
            }
        }
    }

    fn rotate_server(&mut self) {
        self.client = None;
        if !self.config.servers.is_empty() {
            self.server_idx = (self.server_idx + 1) % self.config.servers.len();
        }
    }

    fn collect_results(&mut self) {
        while let Ok(result) = self.results_rx.try_recv() {
            let is_current = self
                .running
                .get(&result.task_id)
                .is_some_and(|t| t.epoch == result.epoch);
            if is_current {
                self.running.remove(&result.task_id);
            }

            let report = TaskReport::new(result.task_id, result.epoch);
            if result.success {
                self.outbox.completed.push(report);
            } else {
                let error = result.error.unwrap_or_else(|| "task failed".to_string());
                self.outbox.failed.push(report.with_error(error));
            }
        }
    }

    fn handle_reply(&mut self, reply: &HeartbeatReply) {
        for &(task_id, epoch) in &reply.cancellations {
            match self.running.get(&task_id) {
                Some(task) if task.epoch == epoch && task.handle.is_finished() => {
                    // Its result is already queued and will be reported
                }
                Some(task) if task.epoch == epoch => {
                    task.handle.abort();
                    self.running.remove(&task_id);
                    tracing::info!(task_id = %task_id, epoch, "Task cancelled");
                    self.outbox.cancelled.push(TaskReport::new(task_id, epoch));
                }
                Some(_) => {}
                None => {
                    // Never ran here (or the agent restarted); confirm right away
                    self.outbox.cancelled.push(TaskReport::new(task_id, epoch));
                }
            }
        }

        let offered: HashSet<(TaskId, Epoch)> = reply
            .assignments
            .iter()
            .map(|a| (a.task_id, a.epoch))
            .collect();
        for assignment in &reply.assignments {
            if !self.seen.contains(&(assignment.task_id, assignment.epoch)) {
                self.start(assignment);
            }
        }
        self.seen = offered;
    }

    fn start(&mut self, assignment: &Assignment) {
        let task_id = assignment.task_id;
        let epoch = assignment.epoch;
        let command = assignment.spec.command.clone();
        let executor = self.executor.clone();
        let results = self.results_tx.clone();

        let handle = tokio::spawn(async move {
            let result = executor.execute(task_id, epoch, &command).await;
            let _ = results.send(result);
        });

        if let Some(previous) = self.running.insert(task_id, RunningTask { epoch, handle }) {
            // A newer epoch supersedes whatever still runs for an older one
            previous.handle.abort();
        }
        self.outbox.started.push(TaskReport::new(task_id, epoch));
    }
}
