use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::grpc::GrpcServer;
use crate::raft::node::RaftMessage;
use crate::raft::RaftNode;
use crate::scheduler::{event_channel, Scheduler, SchedulerEvent, SchedulerHandle};

/// One control-plane replica: consensus, the scheduler loop and the gRPC
/// boundary, wired together.
pub struct Node {
    pub config: NodeConfig,
    pub raft_node: Arc<RaftNode>,
    scheduler: SchedulerHandle,
    raft_rx: mpsc::Receiver<RaftMessage>,
    events_rx: mpsc::Receiver<SchedulerEvent>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let (raft_node, raft_rx) = RaftNode::new(config.clone());
        let (scheduler, events_rx) = event_channel(config.scheduler.event_queue_capacity);

        Self {
            config,
            raft_node: Arc::new(raft_node),
            scheduler,
            raft_rx,
            events_rx,
        }
    }

    /// Handle for enqueueing scheduler events directly
    pub fn scheduler(&self) -> SchedulerHandle {
        self.scheduler.clone()
    }

    /// Run every component, serving gRPC on the configured address.
    ///
    /// Returns once `shutdown` is cancelled and the server has stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.config.listen_addr;
        let server = self.start(shutdown.clone()).await;
        server.run(shutdown).await.map_err(|e| {
            tracing::error!(addr = %addr, error = %e, "gRPC server failed");
            e
        })?;
        Ok(())
    }

    /// Like [`Node::run`], on a listener bound by the caller
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let server = self.start(shutdown.clone()).await;
        server.run_with_listener(listener, shutdown).await?;
        Ok(())
    }

    /// Spawn the Raft and scheduler loops and build the gRPC server
    async fn start(self, shutdown: CancellationToken) -> GrpcServer {
        self.raft_node.connect_to_peers().await;

        let raft_node = self.raft_node.clone();
        let raft_shutdown = shutdown.clone();
        let raft_rx = self.raft_rx;
        tokio::spawn(async move {
            raft_node.run(raft_rx, raft_shutdown).await;
        });

        let scheduler = Scheduler::new(self.raft_node.clone(), self.config.scheduler.clone());
        let events_rx = self.events_rx;
        tokio::spawn(async move {
            scheduler.run(events_rx, shutdown).await;
        });

        tracing::info!(
            node_id = self.config.node_id,
            peers = self.config.peers.len(),
            quorum = self.config.quorum(),
            "Node started"
        );

        GrpcServer::new(self.config.listen_addr, self.raft_node, self.scheduler)
    }
}
