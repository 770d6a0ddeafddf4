use thiserror::Error;
use tonic::Status;
use uuid::Uuid;

use crate::scheduler::TaskState;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Not the leader. {}", leader_hint(.0))]
    NotLeader(Option<u64>),

    #[error("Log entry {epoch} was not acknowledged by a quorum in time")]
    NotDurable { epoch: u64 },

    #[error("Task {task_id} exceeded its retry bound after {retries} failures")]
    MaxRetriesExceeded { task_id: Uuid, retries: u32 },

    #[error("Task not found: {0}")]
    UnknownTask(Uuid),

    #[error("Worker not found: {0}")]
    UnknownWorker(u64),

    #[error("Control plane overloaded: {pending} queued, limit {limit}")]
    Overloaded { pending: usize, limit: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task {task_id} cannot handle {event} while {from}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskState,
        event: String,
    },

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

fn leader_hint(leader: &Option<u64>) -> String {
    match leader {
        Some(id) => format!("Redirect to node {}", id),
        None => "Leader unknown, retry later".to_string(),
    }
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::NotLeader(_) => Status::failed_precondition(message),
            DispatchError::NotDurable { .. } | DispatchError::Unavailable(_) => {
                Status::unavailable(message)
            }
            DispatchError::MaxRetriesExceeded { .. } => Status::aborted(message),
            DispatchError::UnknownTask(_) | DispatchError::UnknownWorker(_) => {
                Status::not_found(message)
            }
            DispatchError::Overloaded { .. } => Status::resource_exhausted(message),
            DispatchError::InvalidArgument(_) => Status::invalid_argument(message),
            DispatchError::InvalidTransition { .. } => Status::failed_precondition(message),
            DispatchError::GrpcError(status) => status,
            DispatchError::Codec(_)
            | DispatchError::TransportError(_)
            | DispatchError::Internal(_) => Status::internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn taxonomy_maps_to_grpc_codes() {
        let id = Uuid::new_v4();
        let cases = vec![
            (DispatchError::NotLeader(Some(2)), Code::FailedPrecondition),
            (DispatchError::NotDurable { epoch: 7 }, Code::Unavailable),
            (DispatchError::UnknownTask(id), Code::NotFound),
            (DispatchError::UnknownWorker(9), Code::NotFound),
            (
                DispatchError::Overloaded {
                    pending: 10,
                    limit: 10,
                },
                Code::ResourceExhausted,
            ),
            (
                DispatchError::MaxRetriesExceeded {
                    task_id: id,
                    retries: 3,
                },
                Code::Aborted,
            ),
            (
                DispatchError::InvalidArgument("empty".into()),
                Code::InvalidArgument,
            ),
        ];

        for (err, code) in cases {
            assert_eq!(Status::from(err).code(), code);
        }
    }

    #[test]
    fn not_leader_message_carries_hint() {
        let status = Status::from(DispatchError::NotLeader(Some(3)));
        assert!(status.message().contains("node 3"));

        let status = Status::from(DispatchError::NotLeader(None));
        assert!(status.message().contains("unknown"));
    }
}
