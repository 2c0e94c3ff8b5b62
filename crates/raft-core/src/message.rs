//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: used by node.rs for state transitions, carried by the raft-peer transport
//! what: VoteRequest, VoteResponse, AppendEntries (heartbeat when empty), AppendEntriesResponse

use serde::{Deserialize, Serialize};

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: u64,
        candidate_id: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Response to a vote request
    VoteResponse {
        term: u64,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: u64,
        leader_id: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<crate::LogEntry>,
        leader_commit: u64,
    },
    /// Response to AppendEntries
    AppendEntriesResponse {
        term: u64,
        success: bool,
    },
}

impl RaftMessage {
    /// The term carried by any message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => *term,
        }
    }

    /// Short operation name, used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
        }
    }
}
