//! Worker agent: heartbeats into the control plane and runs what it is given.
//!
//! - [`WorkerAgent`]: heartbeat loop, report bookkeeping and leader discovery
//! - [`TaskExecutor`]: runs `sh -c <command>` and captures the outcome
//!
//! Commands run directly on the host without sandboxing.

pub mod agent;
pub mod executor;

pub use agent::WorkerAgent;
pub use executor::{ExecutionResult, TaskExecutor};
