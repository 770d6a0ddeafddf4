use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::dispatch_service::DispatchApi;
use crate::grpc::raft_service::RaftPeerService;
use crate::proto::dispatch_service_server::DispatchServiceServer;
use crate::proto::raft_service_server::RaftServiceServer;
use crate::raft::RaftNode;
use crate::scheduler::SchedulerHandle;

pub struct GrpcServer {
    addr: SocketAddr,
    raft_node: Arc<RaftNode>,
    scheduler: SchedulerHandle,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, raft_node: Arc<RaftNode>, scheduler: SchedulerHandle) -> Self {
        Self {
            addr,
            raft_node,
            scheduler,
        }
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let (raft, dispatch) = self.services();
        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(raft)
            .add_service(dispatch)
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Serve on an already bound listener (used for ephemeral ports)
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let (raft, dispatch) = self.services();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        Server::builder()
            .add_service(raft)
            .add_service(dispatch)
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                async move { shutdown.cancelled().await },
            )
            .await
    }

    fn services(
        &self,
    ) -> (
        RaftServiceServer<RaftPeerService>,
        DispatchServiceServer<DispatchApi>,
    ) {
        (
            RaftServiceServer::new(RaftPeerService::new(self.raft_node.clone())),
            DispatchServiceServer::new(DispatchApi::new(self.scheduler.clone())),
        )
    }
}
