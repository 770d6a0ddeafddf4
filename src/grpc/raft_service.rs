use std::sync::Arc;
use tonic::{Request, Response, Status};

use crate::proto::raft_service_server::RaftService;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::RaftNode;

/// Replica-to-replica consensus traffic
pub struct RaftPeerService {
    raft_node: Arc<RaftNode>,
}

impl RaftPeerService {
    pub fn new(raft_node: Arc<RaftNode>) -> Self {
        Self { raft_node }
    }
}

#[tonic::async_trait]
impl RaftService for RaftPeerService {
    async fn request_vote(
        &self,
        request: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        let req = request.into_inner();
        let candidate = req.candidate_id;
        let term = req.term;

        let response = self.raft_node.handle_vote_request(req).await;
        tracing::debug!(
            candidate,
            term,
            granted = response.vote_granted,
            "Answered RequestVote"
        );
        Ok(Response::new(response))
    }

    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(
            leader = req.leader_id,
            term = req.term,
            entries = req.entries.len(),
            leader_commit = req.leader_commit,
            "Received AppendEntries"
        );

        let response = self.raft_node.handle_append_entries(req).await;
        if !response.success {
            tracing::debug!(match_index = response.match_index, "Rejected AppendEntries");
        }
        Ok(Response::new(response))
    }
}
