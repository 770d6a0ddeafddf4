use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry as ProtoLogEntry, VoteRequest,
    VoteResponse,
};
use crate::raft::state::{Command, LogEntry, RaftState};

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest, my_id: u64) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        false
    } else {
        state.voted_for = Some(req.candidate_id);
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
    my_id: u64,
) -> AppendEntriesResponse {
    if req.term < state.current_term {
        return reject(state);
    }

    // A valid leader for this term exists
    state.become_follower(req.term);
    state.leader_id = Some(req.leader_id);

    if req.prev_log_index > 0 {
        match state.get_entry(req.prev_log_index).map(|e| e.term) {
            None => return reject(state),
            Some(term) if term != req.prev_log_term => {
                state.log.truncate((req.prev_log_index - 1) as usize);
                return reject(state);
            }
            Some(_) => {}
        }
    }

    let entries = match req
        .entries
        .iter()
        .map(proto_to_log_entry)
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(node_id = my_id, error = %e, "Undecodable log entry from leader");
            return reject(state);
        }
    };

    let last_new_index = req.prev_log_index + entries.len() as u64;
    if !entries.is_empty() {
        state.merge_entries(req.prev_log_index, entries);
        tracing::debug!(
            node_id = my_id,
            entries_appended = req.entries.len(),
            new_last_index = state.last_log_index(),
            "Appended entries"
        );
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = req.leader_commit.min(last_new_index);
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
        match_index: last_new_index,
    }
}

fn reject(state: &RaftState) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term: state.current_term,
        success: false,
        match_index: state.last_log_index(),
    }
}

/// Decode a replicated entry. Commands travel as JSON.
pub fn proto_to_log_entry(proto: &ProtoLogEntry) -> Result<LogEntry, serde_json::Error> {
    let command: Command = serde_json::from_slice(&proto.command)?;
    Ok(LogEntry {
        term: proto.term,
        index: proto.index,
        command,
    })
}

pub fn log_entry_to_proto(entry: &LogEntry) -> Result<ProtoLogEntry, serde_json::Error> {
    Ok(ProtoLogEntry {
        term: entry.term,
        index: entry.index,
        command: serde_json::to_vec(&entry.command)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state::RaftRole;
    use crate::scheduler::task::TaskSpec;
    use chrono::Utc;
    use uuid::Uuid;

    fn proto_entry(term: u64, index: u64) -> ProtoLogEntry {
        log_entry_to_proto(&LogEntry {
            term,
            index,
            command: Command::Noop,
        })
        .unwrap()
    }

    fn append(
        term: u64,
        prev: (u64, u64),
        entries: Vec<ProtoLogEntry>,
        commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 1,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn command_survives_wire_encoding() {
        let entry = LogEntry {
            term: 3,
            index: 7,
            command: Command::SubmitTask {
                task_id: Uuid::new_v4(),
                spec: TaskSpec::new("echo hi"),
                submitted_at: Utc::now(),
            },
        };
        let decoded = proto_to_log_entry(&log_entry_to_proto(&entry).unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn vote_granted_once_per_term() {
        let mut state = RaftState::new();
        let req = |candidate| VoteRequest {
            term: 1,
            candidate_id: candidate,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(handle_request_vote(&mut state, &req(2), 1).vote_granted);
        assert!(handle_request_vote(&mut state, &req(2), 1).vote_granted);
        assert!(!handle_request_vote(&mut state, &req(3), 1).vote_granted);
    }

    #[test]
    fn vote_denied_to_stale_log() {
        let mut state = RaftState::new();
        state.current_term = 2;
        state.append_entry(Command::Noop);
        let resp = handle_request_vote(
            &mut state,
            &VoteRequest {
                term: 3,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
            1,
        );
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 3);
    }

    #[test]
    fn append_rejects_old_term() {
        let mut state = RaftState::new();
        state.current_term = 5;
        let resp = handle_append_entries(&mut state, &append(4, (0, 0), vec![], 0), 2);
        assert!(!resp.success);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn append_rejects_missing_prev_entry() {
        let mut state = RaftState::new();
        let resp = handle_append_entries(&mut state, &append(1, (3, 1), vec![], 0), 2);
        assert!(!resp.success);
        assert_eq!(state.leader_id, Some(1));
    }

    #[test]
    fn append_stores_entries_and_commits() {
        let mut state = RaftState::new();
        let resp = handle_append_entries(
            &mut state,
            &append(1, (0, 0), vec![proto_entry(1, 1), proto_entry(1, 2)], 1),
            2,
        );
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(state.commit_index, 1);

        // heartbeat with a higher commit index
        let resp = handle_append_entries(&mut state, &append(1, (2, 1), vec![], 5), 2);
        assert!(resp.success);
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let mut state = RaftState::new();
        handle_append_entries(
            &mut state,
            &append(1, (0, 0), vec![proto_entry(1, 1), proto_entry(1, 2)], 0),
            2,
        );
        let req = append(2, (1, 1), vec![proto_entry(2, 2)], 0);
        let resp = handle_append_entries(&mut state, &req, 2);
        assert!(resp.success);
        assert_eq!(state.log.len(), 2);
        assert_eq!(state.log[1].term, 2);
    }

    #[test]
    fn candidate_steps_down_on_append() {
        let mut state = RaftState::new();
        state.become_candidate(2);
        let resp = handle_append_entries(&mut state, &append(1, (0, 0), vec![], 0), 2);
        assert!(resp.success);
        assert_eq!(state.role, RaftRole::Follower);
    }
}
