use tonic::{Request, Response, Status};

use crate::grpc::convert::{
    heartbeat_from_proto, parse_task_id, reply_to_proto, resources_to_proto, spec_from_request,
    task_state_to_proto, task_to_info,
};
use crate::proto::dispatch_service_server::DispatchService;
use crate::proto::{
    CancelTaskRequest, CancelTaskResponse, GetClusterStatusRequest, GetClusterStatusResponse,
    GetTaskStatusRequest, GetTaskStatusResponse, GetWorkerStatusRequest, GetWorkerStatusResponse,
    HeartbeatRequest, HeartbeatResponse, ListTasksRequest, ListTasksResponse, StateCount,
    SubmitTaskRequest, SubmitTaskResponse,
};
use crate::scheduler::SchedulerHandle;

/// gRPC front of the scheduler for submitters and workers.
///
/// Handlers only translate messages; every request becomes an event on the
/// scheduler's queue.
pub struct DispatchApi {
    scheduler: SchedulerHandle,
}

impl DispatchApi {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[tonic::async_trait]
impl DispatchService for DispatchApi {
    async fn submit_task(
        &self,
        request: Request<SubmitTaskRequest>,
    ) -> Result<Response<SubmitTaskResponse>, Status> {
        let req = request.into_inner();

        if req.command.trim().is_empty() {
            return Err(Status::invalid_argument("Command cannot be empty"));
        }
        let spec = spec_from_request(&req)?;

        let receipt = self.scheduler.submit(spec).await?;
        Ok(Response::new(SubmitTaskResponse {
            task_id: receipt.task_id.to_string(),
            epoch: receipt.epoch,
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let report = heartbeat_from_proto(&request.into_inner())?;
        let reply = self.scheduler.heartbeat(report).await?;
        Ok(Response::new(reply_to_proto(&reply)))
    }

    async fn get_task_status(
        &self,
        request: Request<GetTaskStatusRequest>,
    ) -> Result<Response<GetTaskStatusResponse>, Status> {
        let task_id = parse_task_id(&request.into_inner().task_id)?;
        let task = self.scheduler.task_status(task_id).await?;
        Ok(Response::new(GetTaskStatusResponse {
            task: Some(task_to_info(&task)),
        }))
    }

    async fn cancel_task(
        &self,
        request: Request<CancelTaskRequest>,
    ) -> Result<Response<CancelTaskResponse>, Status> {
        let task_id = parse_task_id(&request.into_inner().task_id)?;
        let task = self.scheduler.cancel(task_id).await?;
        Ok(Response::new(CancelTaskResponse {
            state: task_state_to_proto(task.state) as i32,
            cancel_requested: task.cancel_requested,
        }))
    }

    async fn get_worker_status(
        &self,
        request: Request<GetWorkerStatusRequest>,
    ) -> Result<Response<GetWorkerStatusResponse>, Status> {
        let status = self
            .scheduler
            .worker_status(request.into_inner().worker_id)
            .await?;
        Ok(Response::new(GetWorkerStatusResponse {
            worker_id: status.worker_id,
            capacity: resources_to_proto(&status.capacity),
            spare: resources_to_proto(&status.spare),
            task_ids: status.task_ids.iter().map(|id| id.to_string()).collect(),
            last_heartbeat_age_ms: status.last_heartbeat_age.as_millis() as u64,
        }))
    }

    async fn list_tasks(
        &self,
        _request: Request<ListTasksRequest>,
    ) -> Result<Response<ListTasksResponse>, Status> {
        let tasks = self.scheduler.list_tasks().await?;
        Ok(Response::new(ListTasksResponse {
            tasks: tasks.iter().map(task_to_info).collect(),
        }))
    }

    async fn get_cluster_status(
        &self,
        _request: Request<GetClusterStatusRequest>,
    ) -> Result<Response<GetClusterStatusResponse>, Status> {
        let summary = self.scheduler.summary().await?;
        let raft = summary.raft;

        Ok(Response::new(GetClusterStatusResponse {
            node_id: raft.node_id,
            role: raft.role.to_string(),
            current_term: raft.current_term,
            leader_id: raft.leader_id.unwrap_or(0),
            commit_index: raft.commit_index,
            last_applied: raft.last_applied,
            live_workers: summary.live_workers,
            task_counts: summary
                .counts
                .into_iter()
                .map(|(state, count)| StateCount {
                    state: task_state_to_proto(state) as i32,
                    count: count as u64,
                })
                .collect(),
        }))
    }
}
