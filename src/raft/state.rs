use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::task::{Epoch, TaskEvent, TaskId, TaskSpec, WorkerId};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Commands recorded in the assignment log.
///
/// Timestamps are captured by the leader when proposing, so applying the same
/// log anywhere yields the same state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    SubmitTask {
        task_id: TaskId,
        spec: TaskSpec,
        submitted_at: DateTime<Utc>,
    },
    /// The entry index becomes the assignment epoch
    Assign {
        task_id: TaskId,
        worker_id: WorkerId,
        assigned_at: DateTime<Utc>,
    },
    TaskEvent {
        task_id: TaskId,
        epoch: Epoch,
        event: TaskEvent,
        at: DateTime<Utc>,
    },
    /// Forget terminal tasks past their retention window
    Purge { task_ids: Vec<TaskId> },
    /// Appended by a new leader so it can commit entries from earlier terms
    Noop,
}

/// A single entry in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Command,
}

/// Consensus state of one control-plane replica.
///
/// The log is 1-indexed; index 0 means "before the first entry". A leader
/// only appends, and only entries of its own term are committed by counting
/// replicas (earlier entries commit along with them).
#[derive(Debug)]
pub struct RaftState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    pub commit_index: u64,
    pub last_applied: u64,

    // Leader only, reset on election
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    pub role: RaftRole,
    pub leader_id: Option<u64>,
    pub votes_received: u64,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
        }
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    pub fn term_at(&self, index: u64) -> u64 {
        self.get_entry(index).map(|e| e.term).unwrap_or(0)
    }

    /// Entries with index >= `start_index`
    pub fn get_entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.saturating_sub(1) as usize;
        self.log.get(start..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Committed entries with index in `(after, commit_index]`
    pub fn committed_after(&self, after: u64) -> Vec<LogEntry> {
        if after >= self.commit_index {
            return Vec::new();
        }
        let start = after as usize;
        let end = (self.commit_index as usize).min(self.log.len());
        self.log[start..end].to_vec()
    }

    /// Append a command in the current term; returns its index
    pub fn append_entry(&mut self, command: Command) -> u64 {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });
        index
    }

    /// Merge entries received from the leader, starting right after
    /// `prev_index`. Matching entries are kept; the log is truncated at the
    /// first conflicting term.
    pub fn merge_entries(&mut self, prev_index: u64, entries: Vec<LogEntry>) {
        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_index + 1 + offset as u64;
            match self.get_entry(index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    self.log.truncate((index - 1) as usize);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_log_index())
    }

    /// Step down. The vote is only cleared when the term actually moves.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
    }

    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1;
        self.leader_id = None;
    }

    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let last_log_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, last_log_index + 1);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Move the commit index to the highest index stored on a majority
    /// (counting ourselves), if that entry belongs to the current term.
    /// Returns true if it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut match_indices: Vec<u64> = self.match_index.values().copied().collect();
        match_indices.push(self.last_log_index());
        match_indices.sort_unstable();

        // Ascending order: everything from this position up is >= the value,
        // and that covers a majority of the cluster.
        let majority_index = match_indices[(match_indices.len() - 1) / 2];

        if majority_index > self.commit_index && self.term_at(majority_index) == self.current_term
        {
            self.commit_index = majority_index;
            true
        } else {
            false
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: Command::Noop,
        }
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert!(state.log.is_empty());
    }

    #[test]
    fn test_candidate_then_leader() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.votes_received, 1);

        state.append_entry(Command::Noop);
        state.become_leader(1, &[2, 3]);
        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id, Some(1));
        assert_eq!(state.next_index.get(&2), Some(&2));
        assert_eq!(state.match_index.get(&3), Some(&0));
    }

    #[test]
    fn test_follower_keeps_vote_within_term() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(1);
        assert_eq!(state.voted_for, Some(1));

        state.become_follower(4);
        assert_eq!(state.current_term, 4);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn test_append_assigns_increasing_indices() {
        let mut state = RaftState::new();
        state.current_term = 1;
        assert_eq!(state.append_entry(Command::Noop), 1);
        state.current_term = 2;
        assert_eq!(
            state.append_entry(Command::Purge { task_ids: vec![Uuid::new_v4()] }),
            2
        );
        assert_eq!(state.last_log_index(), 2);
        assert_eq!(state.last_log_term(), 2);
        assert_eq!(state.term_at(1), 1);
        assert_eq!(state.term_at(9), 0);
    }

    #[test]
    fn test_get_entries_from() {
        let mut state = RaftState::new();
        state.current_term = 1;
        for _ in 0..3 {
            state.append_entry(Command::Noop);
        }
        assert_eq!(state.get_entries_from(2).len(), 2);
        assert_eq!(state.get_entries_from(0).len(), 3);
        assert!(state.get_entries_from(10).is_empty());
    }

    #[test]
    fn test_committed_after() {
        let mut state = RaftState::new();
        state.current_term = 1;
        for _ in 0..4 {
            state.append_entry(Command::Noop);
        }
        state.commit_index = 3;
        let entries = state.committed_after(1);
        assert_eq!(entries.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert!(state.committed_after(3).is_empty());
    }

    #[test]
    fn test_merge_keeps_matching_and_truncates_conflicts() {
        let mut state = RaftState::new();
        state.log = vec![entry(1, 1), entry(1, 2), entry(1, 3)];

        // Re-delivery of a prefix is harmless
        state.merge_entries(0, vec![entry(1, 1)]);
        assert_eq!(state.log.len(), 3);

        state.merge_entries(1, vec![entry(2, 2)]);
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[1].term, 2);

        state.merge_entries(2, vec![entry(2, 3), entry(2, 4)]);
        assert_eq!(state.last_log_index(), 4);
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();
        assert!(state.is_log_up_to_date(0, 0));

        state.log = vec![entry(1, 1), entry(2, 2)];
        assert!(state.is_log_up_to_date(1, 3));
        assert!(state.is_log_up_to_date(2, 2));
        assert!(!state.is_log_up_to_date(5, 1));
        assert!(!state.is_log_up_to_date(1, 2));
    }

    #[test]
    fn test_single_node_commits_immediately() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_leader(1, &[]);
        state.append_entry(Command::Noop);
        assert!(state.advance_commit_index());
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn test_commit_needs_majority() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_leader(1, &[2, 3, 4, 5]);
        state.append_entry(Command::Noop);

        state.match_index.insert(2, 1);
        assert!(!state.advance_commit_index());
        state.match_index.insert(3, 1);
        assert!(state.advance_commit_index());
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn test_no_commit_of_previous_term_by_counting() {
        let mut state = RaftState::new();
        state.log = vec![entry(1, 1)];
        state.current_term = 2;
        state.role = RaftRole::Leader;
        state.match_index.insert(2, 1);
        state.match_index.insert(3, 1);
        assert!(!state.advance_commit_index());

        state.append_entry(Command::Noop);
        state.match_index.insert(2, 2);
        assert!(state.advance_commit_index());
        assert_eq!(state.commit_index, 2);
    }
}
