//! Mapping between wire messages and scheduler types.

use crate::error::{DispatchError, Result};
use crate::proto::{
    self, HeartbeatRequest, HeartbeatResponse, ResourceAmount, ResourceKind as ProtoResourceKind,
    TaskAssignment, TaskInfo, TaskState as ProtoTaskState,
};
use crate::scheduler::{
    Assignment, HeartbeatReply, HeartbeatReport, ResourceKind, Resources, Task, TaskId,
    TaskReport, TaskSpec, TaskState,
};

pub fn parse_task_id(raw: &str) -> Result<TaskId> {
    raw.parse()
        .map_err(|_| DispatchError::InvalidArgument(format!("invalid task id '{}'", raw)))
}

pub fn resource_kind_to_proto(kind: ResourceKind) -> ProtoResourceKind {
    match kind {
        ResourceKind::Cpu => ProtoResourceKind::Cpu,
        ResourceKind::Memory => ProtoResourceKind::Memory,
        ResourceKind::Gpu => ProtoResourceKind::Gpu,
    }
}

pub fn resources_to_proto(resources: &Resources) -> Vec<ResourceAmount> {
    resources
        .iter()
        .map(|(kind, amount)| ResourceAmount {
            kind: resource_kind_to_proto(kind) as i32,
            amount,
        })
        .collect()
}

pub fn resources_from_proto(amounts: &[ResourceAmount]) -> Result<Resources> {
    let mut resources = Resources::new();
    for amount in amounts {
        let kind = match ProtoResourceKind::try_from(amount.kind) {
            Ok(ProtoResourceKind::Cpu) => ResourceKind::Cpu,
            Ok(ProtoResourceKind::Memory) => ResourceKind::Memory,
            Ok(ProtoResourceKind::Gpu) => ResourceKind::Gpu,
            _ => {
                return Err(DispatchError::InvalidArgument(format!(
                    "unknown resource kind {}",
                    amount.kind
                )))
            }
        };
        resources.set(kind, resources.get(kind) + amount.amount);
    }
    Ok(resources)
}

pub fn task_state_to_proto(state: TaskState) -> ProtoTaskState {
    match state {
        TaskState::Pending => ProtoTaskState::Pending,
        TaskState::Assigned => ProtoTaskState::Assigned,
        TaskState::Running => ProtoTaskState::Running,
        TaskState::Completed => ProtoTaskState::Completed,
        TaskState::Failed => ProtoTaskState::Failed,
        TaskState::Cancelled => ProtoTaskState::Cancelled,
    }
}

pub fn task_state_from_proto(state: ProtoTaskState) -> Option<TaskState> {
    match state {
        ProtoTaskState::Unspecified => None,
        ProtoTaskState::Pending => Some(TaskState::Pending),
        ProtoTaskState::Assigned => Some(TaskState::Assigned),
        ProtoTaskState::Running => Some(TaskState::Running),
        ProtoTaskState::Completed => Some(TaskState::Completed),
        ProtoTaskState::Failed => Some(TaskState::Failed),
        ProtoTaskState::Cancelled => Some(TaskState::Cancelled),
    }
}

pub fn task_to_info(task: &Task) -> TaskInfo {
    TaskInfo {
        task_id: task.id.to_string(),
        state: task_state_to_proto(task.state) as i32,
        command: task.spec.command.clone(),
        assigned_worker: task.assigned_worker.unwrap_or(0),
        epoch: task.epoch,
        retry_count: task.retry_count,
        max_retries: task.spec.max_retries,
        error: task.last_error.clone().unwrap_or_default(),
        cancel_requested: task.cancel_requested,
        submitted_at_ms: task.submitted_at.timestamp_millis(),
        finished_at_ms: task.finished_at.map(|at| at.timestamp_millis()),
        resources: resources_to_proto(&task.spec.resources),
    }
}

pub fn spec_from_request(req: &proto::SubmitTaskRequest) -> Result<TaskSpec> {
    Ok(TaskSpec::new(req.command.clone())
        .with_resources(resources_from_proto(&req.resources)?)
        .with_max_retries(req.max_retries))
}

fn report_to_proto(report: &TaskReport) -> proto::TaskReport {
    proto::TaskReport {
        task_id: report.task_id.to_string(),
        epoch: report.epoch,
        error: report.error.clone().unwrap_or_default(),
    }
}

fn report_from_proto(report: &proto::TaskReport) -> Result<TaskReport> {
    Ok(TaskReport {
        task_id: parse_task_id(&report.task_id)?,
        epoch: report.epoch,
        error: (!report.error.is_empty()).then(|| report.error.clone()),
    })
}

fn reports_from_proto(reports: &[proto::TaskReport]) -> Result<Vec<TaskReport>> {
    reports.iter().map(report_from_proto).collect()
}

pub fn heartbeat_to_proto(report: &HeartbeatReport) -> HeartbeatRequest {
    let convert = |reports: &[TaskReport]| reports.iter().map(report_to_proto).collect();
    HeartbeatRequest {
        worker_id: report.worker_id,
        capacity: resources_to_proto(&report.capacity),
        started: convert(&report.started),
        completed: convert(&report.completed),
        failed: convert(&report.failed),
        cancelled: convert(&report.cancelled),
    }
}

pub fn heartbeat_from_proto(req: &HeartbeatRequest) -> Result<HeartbeatReport> {
    Ok(HeartbeatReport {
        worker_id: req.worker_id,
        capacity: resources_from_proto(&req.capacity)?,
        started: reports_from_proto(&req.started)?,
        completed: reports_from_proto(&req.completed)?,
        failed: reports_from_proto(&req.failed)?,
        cancelled: reports_from_proto(&req.cancelled)?,
    })
}

pub fn reply_to_proto(reply: &HeartbeatReply) -> HeartbeatResponse {
    HeartbeatResponse {
        assignments: reply
            .assignments
            .iter()
            .map(|a| TaskAssignment {
                task_id: a.task_id.to_string(),
                epoch: a.epoch,
                command: a.spec.command.clone(),
                resources: resources_to_proto(&a.spec.resources),
            })
            .collect(),
        cancel: reply
            .cancellations
            .iter()
            .map(|(task_id, epoch)| report_to_proto(&TaskReport::new(*task_id, *epoch)))
            .collect(),
        leader_id: reply.leader_id.unwrap_or(0),
    }
}

pub fn reply_from_proto(resp: &HeartbeatResponse) -> Result<HeartbeatReply> {
    let assignments = resp
        .assignments
        .iter()
        .map(|a| {
            Ok(Assignment {
                task_id: parse_task_id(&a.task_id)?,
                epoch: a.epoch,
                spec: TaskSpec::new(a.command.clone())
                    .with_resources(resources_from_proto(&a.resources)?),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let cancellations = resp
        .cancel
        .iter()
        .map(|c| Ok((parse_task_id(&c.task_id)?, c.epoch)))
        .collect::<Result<Vec<_>>>()?;

    Ok(HeartbeatReply {
        assignments,
        cancellations,
        leader_id: (resp.leader_id != 0).then_some(resp.leader_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn unknown_resource_kind_is_rejected() {
        let amounts = vec![ResourceAmount {
            kind: ProtoResourceKind::Unspecified as i32,
            amount: 1,
        }];
        assert!(matches!(
            resources_from_proto(&amounts),
            Err(DispatchError::InvalidArgument(_))
        ));
        let amounts = vec![ResourceAmount { kind: 42, amount: 1 }];
        assert!(resources_from_proto(&amounts).is_err());
    }

    #[test]
    fn repeated_kinds_are_summed() {
        let amounts = vec![
            ResourceAmount {
                kind: ProtoResourceKind::Cpu as i32,
                amount: 500,
            },
            ResourceAmount {
                kind: ProtoResourceKind::Cpu as i32,
                amount: 250,
            },
        ];
        let resources = resources_from_proto(&amounts).unwrap();
        assert_eq!(resources.get(ResourceKind::Cpu), 750);
    }

    #[test]
    fn bad_task_id_is_invalid_argument() {
        assert!(matches!(
            parse_task_id("not-a-uuid"),
            Err(DispatchError::InvalidArgument(_))
        ));
        let id = Uuid::new_v4();
        assert_eq!(parse_task_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn task_info_reports_unassigned_as_zero() {
        let task = Task::new(Uuid::new_v4(), TaskSpec::new("true"), Utc::now());
        let info = task_to_info(&task);
        assert_eq!(info.assigned_worker, 0);
        assert_eq!(info.state, ProtoTaskState::Pending as i32);
        assert!(info.finished_at_ms.is_none());
        assert!(info.error.is_empty());
    }

    #[test]
    fn empty_error_means_no_error() {
        let report = report_from_proto(&proto::TaskReport {
            task_id: Uuid::new_v4().to_string(),
            epoch: 3,
            error: String::new(),
        })
        .unwrap();
        assert_eq!(report.error, None);
    }

    #[test]
    fn heartbeat_reply_keeps_cancellations() {
        let task_id = Uuid::new_v4();
        let reply = HeartbeatReply {
            assignments: vec![Assignment {
                task_id,
                epoch: 7,
                spec: TaskSpec::new("sleep 1")
                    .with_resources(Resources::new().with(ResourceKind::Gpu, 1)),
            }],
            cancellations: vec![(task_id, 7)],
            leader_id: None,
        };
        let decoded = reply_from_proto(&reply_to_proto(&reply)).unwrap();
        assert_eq!(decoded.assignments, reply.assignments);
        assert_eq!(decoded.cancellations, vec![(task_id, 7)]);
        assert_eq!(decoded.leader_id, None);
    }
}
