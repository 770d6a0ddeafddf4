use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::error::{DispatchError, Result};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::rpc::{handle_append_entries, handle_request_vote, log_entry_to_proto};
use crate::raft::state::{Command, LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;

/// Bound on proposals waiting for the Raft loop
pub const PROPOSAL_QUEUE_CAPACITY: usize = 256;

const RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Where a proposal landed in the leader's log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub index: u64,
    pub term: u64,
}

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Request to append a command to the log
    AppendCommand {
        command: Command,
        response_tx: oneshot::Sender<Result<Appended>>,
    },
    /// Heartbeat received from leader (resets election timeout)
    HeartbeatReceived,
    /// Trigger election
    TriggerElection,
}

/// Point-in-time view of the consensus state
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: u64,
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_len: usize,
}

/// One control-plane replica of the assignment log
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    peers: Arc<Mutex<HashMap<u64, RaftServiceClient<Channel>>>>,
    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,
    commit_tx: Arc<watch::Sender<u64>>,
}

impl RaftNode {
    pub fn new(config: NodeConfig) -> (Self, mpsc::Receiver<RaftMessage>) {
        let (message_tx, message_rx) = mpsc::channel(PROPOSAL_QUEUE_CAPACITY);
        let (commit_tx, _) = watch::channel(0);

        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(RaftState::new())),
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            message_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            commit_tx: Arc::new(commit_tx),
        };

        (node, message_rx)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Watch the commit index
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Set up clients for every configured peer.
    ///
    /// Channels connect lazily and reconnect on their own, so peers that are
    /// not up yet are picked up once they start.
    pub async fn connect_to_peers(&self) {
        let mut peers = self.peers.lock().await;
        for peer in &self.config.peers {
            let addr = format!("http://{}", peer.addr);
            match Endpoint::from_shared(addr.clone()) {
                Ok(endpoint) => {
                    let channel = endpoint
                        .connect_timeout(Duration::from_millis(500))
                        .connect_lazy();
                    peers.insert(peer.node_id, RaftServiceClient::new(channel));
                    tracing::info!(peer_id = peer.node_id, addr = %addr, "Peer client ready");
                }
                Err(e) => {
                    tracing::warn!(
                        peer_id = peer.node_id,
                        addr = %addr,
                        error = %e,
                        "Invalid peer address"
                    );
                }
            }
        }
    }

    /// Run the Raft node main loop until `shutdown` fires
    pub async fn run(
        &self,
        mut message_rx: mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) {
        let mut election_timeout = random_election_timeout(&self.config);
        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval_ms);

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = self.id, "Raft loop shutting down");
                    break;
                }

                msg = message_rx.recv() => {
                    match msg {
                        Some(RaftMessage::AppendCommand { command, response_tx }) => {
                            let result = self.handle_append_command(command).await;
                            let _ = response_tx.send(result);
                        }
                        Some(RaftMessage::HeartbeatReceived) => {
                            *self.last_heartbeat.write().await = Instant::now();
                            election_timeout = random_election_timeout(&self.config);
                        }
                        Some(RaftMessage::TriggerElection) => {
                            self.start_election().await;
                        }
                        None => break,
                    }
                }

                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(&self.config);
                }

                _ = tokio::time::sleep(heartbeat_interval), if role == RaftRole::Leader => {
                    self.replicate().await;
                }
            }
        }
    }

    fn majority(&self) -> u64 {
        self.config.quorum() as u64
    }

    fn peer_ids(&self) -> Vec<u64> {
        self.config.peers.iter().map(|p| p.node_id).collect()
    }

    async fn start_election(&self) {
        let req = {
            let mut state = self.state.write().await;
            state.become_candidate(self.id);
            VoteRequest {
                term: state.current_term,
                candidate_id: self.id,
                last_log_index: state.last_log_index(),
                last_log_term: state.last_log_term(),
            }
        };
        *self.last_heartbeat.write().await = Instant::now();
        let term = req.term;

        tracing::info!(node_id = self.id, term, "Starting election");

        let clients: Vec<(u64, RaftServiceClient<Channel>)> = self
            .peers
            .lock()
            .await
            .iter()
            .map(|(id, client)| (*id, client.clone()))
            .collect();

        let mut requests = JoinSet::new();
        for (peer_id, mut client) in clients {
            let req = req.clone();
            requests.spawn(async move {
                (peer_id, timeout(RPC_TIMEOUT, client.request_vote(req)).await)
            });
        }

        let mut votes = 1u64;
        while let Some(joined) = requests.join_next().await {
            let Ok((peer_id, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        self.state.write().await.become_follower(resp.term);
                        return;
                    }
                    if resp.vote_granted {
                        votes += 1;
                        tracing::debug!(node_id = self.id, peer_id, votes, "Received vote");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer_id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::debug!(peer_id, "Vote request timed out");
                }
            }
        }

        let commit = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Candidate || state.current_term != term {
                return;
            }
            state.votes_received = votes;
            if votes < self.majority() {
                tracing::debug!(
                    node_id = self.id,
                    term,
                    votes,
                    needed = self.majority(),
                    "Election failed, not enough votes"
                );
                return;
            }

            state.become_leader(self.id, &self.peer_ids());
            // Entries from earlier terms only commit behind one of our own
            state.append_entry(Command::Noop);
            state.advance_commit_index();
            tracing::info!(node_id = self.id, term, votes, "Became leader");
            state.commit_index
        };

        self.commit_tx.send_replace(commit);
        self.replicate().await;
    }

    /// Ship log entries (or an empty heartbeat) to every follower
    async fn replicate(&self) {
        let state = self.state.read().await;
        if state.role != RaftRole::Leader {
            return;
        }

        let term = state.current_term;
        let commit_index = state.commit_index;
        let next_index = state.next_index.clone();
        let log_snapshot: Vec<LogEntry> = state.log.clone();
        drop(state);

        let peers = self.peers.lock().await;

        for (peer_id, client) in peers.iter() {
            let peer_next_index = next_index.get(peer_id).copied().unwrap_or(1).max(1);
            let prev_log_index = peer_next_index - 1;
            let prev_log_term = if prev_log_index == 0 {
                0
            } else {
                log_snapshot
                    .get((prev_log_index - 1) as usize)
                    .map(|e| e.term)
                    .unwrap_or(0)
            };

            let entries = match log_snapshot
                .iter()
                .filter(|e| e.index >= peer_next_index)
                .map(log_entry_to_proto)
                .collect::<std::result::Result<Vec<_>, _>>()
            {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(peer_id, error = %e, "Failed to encode log entries");
                    continue;
                }
            };

            let req = AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let mut client = client.clone();
            let peer_id = *peer_id;
            let state = self.state.clone();
            let commit_tx = self.commit_tx.clone();

            tokio::spawn(async move {
                match timeout(RPC_TIMEOUT, client.append_entries(req)).await {
                    Ok(Ok(response)) => {
                        let resp = response.into_inner();
                        let mut state = state.write().await;

                        if resp.term > state.current_term {
                            tracing::info!(
                                peer_id,
                                term = resp.term,
                                "Higher term seen, stepping down"
                            );
                            state.become_follower(resp.term);
                            state.leader_id = None;
                            return;
                        }
                        if state.role != RaftRole::Leader || state.current_term != term {
                            return;
                        }

                        if resp.success {
                            let matched = state.match_index.get(&peer_id).copied().unwrap_or(0);
                            if resp.match_index > matched {
                                state.match_index.insert(peer_id, resp.match_index);
                            }
                            state.next_index.insert(peer_id, resp.match_index + 1);

                            if state.advance_commit_index() {
                                tracing::debug!(
                                    commit_index = state.commit_index,
                                    "Updated commit index"
                                );
                                commit_tx.send_replace(state.commit_index);
                            }
                        } else {
                            // Back off towards the follower's last index
                            let current = state.next_index.get(&peer_id).copied().unwrap_or(1);
                            let next = (current.saturating_sub(1)).min(resp.match_index + 1).max(1);
                            state.next_index.insert(peer_id, next);
                        }
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer_id, error = %e, "AppendEntries failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer_id, "AppendEntries timed out");
                    }
                }
            });
        }
    }

    /// Append a command to the leader's log and start replicating it
    async fn handle_append_command(&self, command: Command) -> Result<Appended> {
        let (appended, committed) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(DispatchError::NotLeader(state.leader_id));
            }

            let index = state.append_entry(command);
            let appended = Appended {
                index,
                term: state.current_term,
            };
            tracing::debug!(index, term = appended.term, "Appended command to log");
            let committed = state.advance_commit_index().then_some(state.commit_index);
            (appended, committed)
        };

        if let Some(commit) = committed {
            self.commit_tx.send_replace(commit);
        }
        self.replicate().await;
        Ok(appended)
    }

    /// Append `command` and wait until a quorum stores it.
    ///
    /// Returns the entry index. Fails with `Overloaded` if the proposal queue
    /// is full, `NotLeader` on followers and `NotDurable` if no quorum
    /// acknowledges the entry within `quorum_timeout`. An entry reported as
    /// not durable may still commit later.
    pub async fn propose(&self, command: Command, quorum_timeout: Duration) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.message_tx
            .try_send(RaftMessage::AppendCommand {
                command,
                response_tx: tx,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => DispatchError::Overloaded {
                    pending: PROPOSAL_QUEUE_CAPACITY,
                    limit: PROPOSAL_QUEUE_CAPACITY,
                },
                TrySendError::Closed(_) => {
                    DispatchError::Unavailable("raft loop stopped".to_string())
                }
            })?;

        let deadline = Instant::now() + quorum_timeout;
        let appended = match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(DispatchError::Unavailable(
                    "raft loop dropped the proposal".to_string(),
                ))
            }
            Err(_) => {
                tracing::warn!(node_id = self.id, "Raft loop did not accept proposal in time");
                return Err(DispatchError::NotDurable { epoch: 0 });
            }
        };

        self.wait_for_commit(appended, deadline).await?;
        Ok(appended.index)
    }

    async fn wait_for_commit(&self, appended: Appended, deadline: Instant) -> Result<()> {
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            {
                let state = self.state.read().await;
                if state.commit_index >= appended.index {
                    // A different term at this index means our entry was overwritten
                    return if state.term_at(appended.index) == appended.term {
                        Ok(())
                    } else {
                        Err(DispatchError::NotDurable {
                            epoch: appended.index,
                        })
                    };
                }
            }

            match timeout_at(deadline, commit_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(DispatchError::Unavailable(
                        "commit channel closed".to_string(),
                    ))
                }
                Err(_) => {
                    tracing::warn!(
                        node_id = self.id,
                        epoch = appended.index,
                        "Entry not acknowledged by a quorum in time"
                    );
                    return Err(DispatchError::NotDurable {
                        epoch: appended.index,
                    });
                }
            }
        }
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        let response = handle_request_vote(&mut state, &req, self.id);
        drop(state);

        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }

        response
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write().await;
        let commit_before = state.commit_index;
        let response = handle_append_entries(&mut state, &req, self.id);
        let commit_after = state.commit_index;
        drop(state);

        // Any message from the current leader resets the election timer
        if response.term == req.term {
            *self.last_heartbeat.write().await = Instant::now();
        }
        if commit_after > commit_before {
            self.commit_tx.send_replace(commit_after);
        }

        response
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    pub async fn get_leader_id(&self) -> Option<u64> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id)
        } else {
            state.leader_id
        }
    }

    /// Committed entries after index `applied`, in order
    pub async fn committed_entries_after(&self, applied: u64) -> Vec<LogEntry> {
        let mut state = self.state.write().await;
        let entries = state.committed_after(applied);
        if let Some(last) = entries.last() {
            state.last_applied = state.last_applied.max(last.index);
        }
        entries
    }

    /// Every entry in the local log, committed or not
    pub async fn log_snapshot(&self) -> Vec<LogEntry> {
        self.state.read().await.log.clone()
    }

    pub async fn status(&self) -> RaftStatus {
        let state = self.state.read().await;
        RaftStatus {
            node_id: self.id,
            role: state.role,
            current_term: state.current_term,
            leader_id: if state.role == RaftRole::Leader {
                Some(self.id)
            } else {
                state.leader_id
            },
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_len: state.log.len(),
        }
    }
}
