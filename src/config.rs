use std::net::SocketAddr;
use std::time::Duration;

use crate::scheduler::resources::Resources;

/// Knobs of the scheduling loop. Every replica should run with the same values.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Silence after which a worker is considered dead
    pub liveness_timeout_ms: u64,
    /// Default retry bound for tasks submitted without one
    pub max_retries: u32,
    /// Submissions are rejected with `Overloaded` at this many pending tasks
    pub max_pending_tasks: usize,
    /// How long a log write may wait for a quorum before `NotDurable`
    pub quorum_timeout_ms: u64,
    /// How long terminal tasks stay queryable
    pub retention_ms: u64,
    /// How long an unconfirmed cancel may stay outstanding
    pub cancel_timeout_ms: u64,
    /// Period of expiry, placement, cancel-timeout and retention checks
    pub scheduler_tick_ms: u64,
    /// Capacity of the scheduler event queue
    pub event_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 5_000,
            max_retries: 3,
            max_pending_tasks: 10_000,
            quorum_timeout_ms: 5_000,
            retention_ms: 600_000,
            cancel_timeout_ms: 30_000,
            scheduler_tick_ms: 100,
            event_queue_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            peers: Vec::new(),
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Replicas needed to commit, counting this node
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}

/// Parse peers in `id:host:port` form, comma separated
pub fn parse_peers(peers: &str) -> Result<Vec<PeerConfig>, String> {
    peers
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|peer| {
            let (id, addr) = peer
                .split_once(':')
                .ok_or_else(|| format!("invalid peer '{}', expected id:host:port", peer))?;
            let node_id = id
                .parse()
                .map_err(|_| format!("invalid peer id in '{}'", peer))?;
            if !addr.contains(':') {
                return Err(format!("invalid peer '{}', expected id:host:port", peer));
            }
            Ok(PeerConfig {
                node_id,
                addr: addr.to_string(),
            })
        })
        .collect()
}

/// Settings of a worker agent
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: u64,
    /// Control-plane addresses (`http://host:port`); the agent rotates
    /// through them until it finds the leader.
    pub servers: Vec<String>,
    pub capacity: Resources,
    pub heartbeat_interval_ms: u64,
}

impl WorkerConfig {
    pub fn new(worker_id: u64, servers: Vec<String>, capacity: Resources) -> Self {
        Self {
            worker_id,
            servers,
            capacity,
            heartbeat_interval_ms: 1_000,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::resources::ResourceKind;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.liveness_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_pending_tasks, 10_000);
        assert_eq!(cfg.quorum_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50051");
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.election_timeout_min_ms, 150);
        assert_eq!(cfg.election_timeout_max_ms, 300);
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.quorum(), 1);
    }

    #[test]
    fn node_config_with_peers() {
        let cfg = NodeConfig::new(1, "10.0.0.1:9000".parse().unwrap())
            .with_peer(2, "127.0.0.1:50052".to_string())
            .with_peer(3, "127.0.0.1:50053".to_string());
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peers[1].node_id, 3);
        assert_eq!(cfg.quorum(), 2);

        let cfg = cfg.with_peer(4, "127.0.0.1:50054".to_string());
        assert_eq!(cfg.quorum(), 3);
    }

    #[test]
    fn parse_peers_accepts_hostnames() {
        let peers = parse_peers("2:127.0.0.1:50052, 3:node-3.internal:7000").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].node_id, 2);
        assert_eq!(peers[0].addr, "127.0.0.1:50052");
        assert_eq!(peers[1].addr, "node-3.internal:7000");
        assert!(parse_peers("").unwrap().is_empty());
    }

    #[test]
    fn parse_peers_rejects_garbage() {
        assert!(parse_peers("two:127.0.0.1:1").is_err());
        assert!(parse_peers("2:127.0.0.1").is_err());
        assert!(parse_peers("2").is_err());
    }

    #[test]
    fn worker_config_new() {
        let capacity = Resources::new().with(ResourceKind::Cpu, 4000);
        let cfg = WorkerConfig::new(7, vec!["http://127.0.0.1:50051".into()], capacity.clone());
        assert_eq!(cfg.worker_id, 7);
        assert_eq!(cfg.capacity, capacity);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
    }
}
