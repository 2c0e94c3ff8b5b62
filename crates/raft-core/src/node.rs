//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, state.rs for persistence
//! what: NodeState enum, RaftNode struct, election / replication / commit rules
//!
//! The node performs no I/O and reads no clock. Every handler returns the
//! reply to send plus whether the caller should reset its election timer; the
//! caller is responsible for saving `hard_state()` whenever
//! `take_persist_pending()` reports a change, before the reply leaves.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::RaftConfig;
use crate::error::CoreError;
use crate::log::{self, LogEntry};
use crate::message::RaftMessage;
use crate::state::PersistentState;

/// Identity of a cluster member
pub type NodeId = u64;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Replicated log, `log[i - 1]` holds index `i`
    pub log: Vec<LogEntry>,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,
    /// Leader only: next index to send to each member
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each member
    pub match_index: HashMap<NodeId, u64>,
    /// Candidate only: members that granted their vote this term
    pub votes_received: Vec<NodeId>,
    /// Leader accepted in the current term, if any
    pub leader_id: Option<NodeId>,
    persist_pending: bool,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: Vec::new(),
            leader_id: None,
            persist_pending: false,
        }
    }

    // -- persistence --

    /// Snapshot of the state that must be durable before replying
    pub fn hard_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
        }
    }

    /// Load previously saved state; volatile state starts from scratch
    pub fn restore(&mut self, state: PersistentState) -> Result<(), CoreError> {
        log::check_contiguous(&state.log)?;
        self.current_term = state.current_term;
        self.voted_for = state.voted_for;
        self.log = state.log;
        self.state = NodeState::Follower;
        self.commit_index = 0;
        self.last_applied = 0;
        self.leader_id = None;
        self.votes_received.clear();
        self.persist_pending = false;
        Ok(())
    }

    /// Returns whether term, vote or log changed since the last call
    pub fn take_persist_pending(&mut self) -> bool {
        std::mem::take(&mut self.persist_pending)
    }

    /// Re-arm the pending flag after a failed save
    pub fn mark_persist_pending(&mut self) {
        self.persist_pending = true;
    }

    // -- quorum --

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map_or(0, |e| e.index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    /// Entry at a 1-based index; index 0 is the empty-log sentinel
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        let position = usize::try_from(index).ok()?.checked_sub(1)?;
        self.log.get(position)
    }

    /// Term of the entry at `index`, 0 when there is none
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.get_entry(index).map_or(0, |e| e.term)
    }

    // -- role transitions --

    /// Step down, adopting `term` if it is newer than ours
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_pending = true;
        }
        if self.state != NodeState::Follower {
            tracing::info!(node = self.id, term = self.current_term, from = ?self.state, "stepping down to follower");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
    }

    /// Begin a new election round and return the vote request to broadcast
    pub fn start_election(&mut self) -> RaftMessage {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.votes_received = vec![self.id];
        self.leader_id = None;
        self.persist_pending = true;
        tracing::info!(node = self.id, term = self.current_term, "starting election");

        RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Promote a candidate holding a quorum of votes
    pub fn try_become_leader(&mut self) -> bool {
        if self.state == NodeState::Candidate && self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    pub fn become_leader(&mut self) {
        let next = self.last_log_index() + 1;
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.next_index = self.cluster_nodes.iter().map(|&p| (p, next)).collect();
        self.match_index = self.cluster_nodes.iter().map(|&p| (p, 0)).collect();
        tracing::info!(node = self.id, term = self.current_term, last_log_index = next - 1, "became leader");
    }

    // -- election --

    /// Decide on a vote request; the bool asks the caller to reset its timer
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            tracing::debug!(node = self.id, candidate = candidate_id, term, current = self.current_term, "rejecting stale vote request");
            return (self.vote_response(false), false);
        }
        if term > self.current_term {
            self.become_follower(term);
        }

        let can_vote = self.voted_for.map_or(true, |v| v == candidate_id);
        let up_to_date = log::is_up_to_date(
            last_log_term,
            last_log_index,
            self.last_log_term(),
            self.last_log_index(),
        );
        if !can_vote || !up_to_date {
            tracing::debug!(node = self.id, candidate = candidate_id, term, can_vote, up_to_date, "denying vote");
            return (self.vote_response(false), false);
        }

        if self.voted_for != Some(candidate_id) {
            self.voted_for = Some(candidate_id);
            self.persist_pending = true;
        }
        tracing::debug!(node = self.id, candidate = candidate_id, term, "granting vote");
        (self.vote_response(true), true)
    }

    /// Count a vote reply; returns true when this reply made us leader
    pub fn handle_vote_response(&mut self, term: u64, vote_granted: bool, from: NodeId) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Candidate || term < self.current_term {
            return false;
        }
        if vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        self.try_become_leader()
    }

    fn vote_response(&self, vote_granted: bool) -> RaftMessage {
        RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    // -- replication (leader side) --

    /// Append a client command at the end of the log. Caller must be leader.
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        self.persist_pending = true;
        entry
    }

    /// Build the append-entries request for `peer`, empty when it is caught up
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        if self.state != NodeState::Leader {
            return None;
        }
        let last = self.last_log_index();
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(last + 1)
            .clamp(1, last + 1);
        let prev_log_index = next - 1;
        let start = usize::try_from(prev_log_index).ok()?;

        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log[start..].to_vec(),
            leader_commit: self.commit_index,
        })
    }

    /// Record a follower's reply; returns true if the commit index advanced.
    ///
    /// `match_index` is the last index covered by the request this reply
    /// answers (`prev_log_index + entries.len()`); ignored on failure.
    pub fn handle_append_entries_response(
        &mut self,
        term: u64,
        success: bool,
        from: NodeId,
        match_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Leader || term < self.current_term {
            return false;
        }

        let last = self.last_log_index();
        if success {
            let matched = self.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(match_index.min(last));
            let matched = *matched;
            let next = self.next_index.entry(from).or_insert(matched + 1);
            *next = (*next).max(matched + 1);
            self.advance_commit_index()
        } else {
            let floor = self.match_index.get(&from).copied().unwrap_or(0) + 1;
            let next = self.next_index.entry(from).or_insert(last + 1);
            *next = next.saturating_sub(1).max(floor);
            tracing::debug!(node = self.id, peer = from, next_index = *next, "log mismatch, backing off");
            false
        }
    }

    /// Move the commit index to the highest current-term entry stored on a
    /// majority. Entries of older terms only commit underneath such an entry.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let quorum = self.quorum_size();
        let mut candidate = self.last_log_index();
        while candidate > self.commit_index {
            let term = self.get_term_at(candidate);
            if term < self.current_term {
                break;
            }
            let replicas = self
                .cluster_nodes
                .iter()
                .filter(|&&p| self.replicated_through(p) >= candidate)
                .count();
            if replicas >= quorum {
                tracing::debug!(node = self.id, term = self.current_term, commit_index = candidate, "advancing commit index");
                self.commit_index = candidate;
                return true;
            }
            candidate -= 1;
        }
        false
    }

    fn replicated_through(&self, peer: NodeId) -> u64 {
        if peer == self.id {
            self.last_log_index()
        } else {
            self.match_index.get(&peer).copied().unwrap_or(0)
        }
    }

    // -- replication (follower side) --

    /// Apply a leader's append-entries; the bool asks the caller to reset its timer
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            tracing::debug!(node = self.id, leader = leader_id, term, current = self.current_term, "rejecting stale append entries");
            return (self.append_response(false), false);
        }
        self.become_follower(term);
        self.leader_id = Some(leader_id);

        let matches_prev = prev_log_index == 0
            || (prev_log_index <= self.last_log_index()
                && self.get_term_at(prev_log_index) == prev_log_term);
        if !matches_prev {
            tracing::debug!(node = self.id, leader = leader_id, prev_log_index, prev_log_term, "log mismatch");
            return (self.append_response(false), true);
        }

        let well_formed = entries
            .iter()
            .enumerate()
            .all(|(offset, e)| e.index == prev_log_index + 1 + offset as u64);
        if !well_formed {
            tracing::warn!(node = self.id, leader = leader_id, prev_log_index, "entries are not contiguous with prev_log_index");
            return (self.append_response(false), true);
        }

        let last_new_index = prev_log_index + entries.len() as u64;
        for entry in entries {
            if entry.index <= self.last_log_index() {
                if self.get_term_at(entry.index) == entry.term {
                    continue;
                }
                if entry.index <= self.commit_index {
                    tracing::warn!(node = self.id, index = entry.index, "leader overwrote a committed entry");
                }
                self.log.truncate((entry.index - 1) as usize);
            }
            self.log.push(entry);
            self.persist_pending = true;
        }

        if leader_commit > self.commit_index {
            let commit = leader_commit.min(last_new_index);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }
        (self.append_response(true), true)
    }

    fn append_response(&self, success: bool) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
        }
    }

    // -- state machine application --

    /// Committed entries not yet applied, in order; marks them applied
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let commit = self.commit_index.min(self.last_log_index());
        if commit <= self.last_applied {
            return Vec::new();
        }
        let entries = self.log[self.last_applied as usize..commit as usize].to_vec();
        self.last_applied = commit;
        entries
    }
}
