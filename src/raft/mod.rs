//! Replication of the assignment log.
//!
//! Leader election and log shipping follow Raft. An entry is durable once a
//! majority of replicas store it; its index doubles as the epoch of the
//! assignment it may carry.

pub mod node;
pub mod rpc;
pub mod state;
pub mod timer;

pub use node::{RaftNode, RaftStatus};
pub use state::{Command, LogEntry, RaftRole, RaftState};
