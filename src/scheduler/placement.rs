use std::cmp::Reverse;

use crate::scheduler::resources::Resources;
use crate::scheduler::task::{Task, TaskId, WorkerId};

/// A live worker as seen by one placement pass
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker_id: WorkerId,
    pub capacity: Resources,
    pub spare: Resources,
}

/// Pick the worker whose spare capacity covers `request`, preferring the one
/// with the most idle capacity. Ties go to the lowest worker id.
pub fn select_worker(candidates: &[Candidate], request: &Resources) -> Option<WorkerId> {
    candidates
        .iter()
        .filter(|c| c.spare.covers(request))
        .min_by_key(|c| (Reverse(c.spare.idle_score(&c.capacity)), c.worker_id))
        .map(|c| c.worker_id)
}

/// Place `pending` tasks (already in submission order) onto `candidates`.
///
/// Spare capacity is reduced as tasks are placed, so a single pass never
/// oversubscribes a worker. Tasks that fit nowhere are skipped.
pub fn plan(pending: &[&Task], mut candidates: Vec<Candidate>) -> Vec<(TaskId, WorkerId)> {
    let mut placements = Vec::new();

    for task in pending {
        let Some(worker_id) = select_worker(&candidates, &task.spec.resources) else {
            tracing::trace!(
                task_id = %task.id,
                resources = %task.spec.resources,
                "No worker fits task"
            );
            continue;
        };
        if let Some(c) = candidates.iter_mut().find(|c| c.worker_id == worker_id) {
            c.spare = c.spare.saturating_sub(&task.spec.resources);
        }
        placements.push((task.id, worker_id));
    }

    placements
}
