use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::scheduler::resources::Resources;
use crate::scheduler::task::WorkerId;

/// Liveness state of one worker
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub id: WorkerId,
    pub last_heartbeat: Instant,
    pub capacity: Resources,
    /// Known only from the task table after a leader change; capacity is
    /// unknown until the worker heartbeats to us.
    pub adopted: bool,
}

impl WorkerState {
    pub fn new(id: WorkerId, capacity: Resources, now: Instant) -> Self {
        Self {
            id,
            last_heartbeat: now,
            capacity,
            adopted: false,
        }
    }

    pub fn is_alive(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) < timeout
    }
}

/// Tracks worker liveness from heartbeats.
///
/// Purely volatile: a new leader rebuilds it from incoming heartbeats.
#[derive(Debug)]
pub struct HeartbeatTracker {
    workers: BTreeMap<WorkerId, WorkerState>,
    liveness_timeout: Duration,
}

impl HeartbeatTracker {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            workers: BTreeMap::new(),
            liveness_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// Record a heartbeat. Returns true when the worker was not known before.
    pub fn record_heartbeat(
        &mut self,
        worker_id: WorkerId,
        capacity: Resources,
        now: Instant,
    ) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(worker) => {
                worker.last_heartbeat = now;
                worker.capacity = capacity;
                worker.adopted = false;
                false
            }
            None => {
                self.workers
                    .insert(worker_id, WorkerState::new(worker_id, capacity, now));
                tracing::info!(worker_id, "Worker registered");
                true
            }
        }
    }

    /// Start tracking a worker we have not heard from yet, giving it one
    /// full liveness window to check in.
    pub fn adopt(&mut self, worker_id: WorkerId, now: Instant) {
        self.workers.entry(worker_id).or_insert_with(|| WorkerState {
            adopted: true,
            ..WorkerState::new(worker_id, Resources::new(), now)
        });
    }

    /// Workers heard from within the liveness timeout, ascending by id
    pub fn list_live_workers(&self, now: Instant) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.is_alive(now, self.liveness_timeout))
            .map(|w| w.id)
            .collect()
    }

    pub fn is_live(&self, worker_id: WorkerId, now: Instant) -> bool {
        self.workers
            .get(&worker_id)
            .is_some_and(|w| w.is_alive(now, self.liveness_timeout))
    }

    pub fn worker(&self, worker_id: WorkerId) -> Option<&WorkerState> {
        self.workers.get(&worker_id)
    }

    /// Drop workers whose liveness timeout has expired and return their ids
    pub fn expire(&mut self, now: Instant) -> Vec<WorkerId> {
        let dead: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| !w.is_alive(now, self.liveness_timeout))
            .map(|w| w.id)
            .collect();
        for id in &dead {
            self.workers.remove(id);
        }
        dead
    }

    pub fn clear(&mut self) {
        self.workers.clear();
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
