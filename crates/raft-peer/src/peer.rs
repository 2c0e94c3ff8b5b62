//! # peer
//!
//! why: own one node's consensus state behind a single lock and expose the client api
//! relations: election.rs and replication.rs run against this handle; Transport delivers inbound requests here
//! what: Raft handle (new / get_state / start / kill / status), inbound dispatch, persist and apply helpers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use raft_core::{
    ElectionTimer, LogEntry, NodeId, NodeState, RaftConfig, RaftMessage, RaftNode,
};
use raft_storage::Storage;
use tokio::sync::mpsc::UnboundedSender;

use crate::apply::ApplyMsg;
use crate::error::RaftError;
use crate::transport::Transport;
use crate::{election, replication};

/// Outcome of [`Raft::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Index the command will occupy if it commits; 0 when not leader
    pub index: u64,
    pub term: u64,
    pub is_leader: bool,
}

/// Point-in-time view of a peer, read under its lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Everything guarded by the peer lock
pub(crate) struct PeerState {
    pub(crate) node: RaftNode,
    pub(crate) timer: ElectionTimer,
}

struct Inner {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    state: Mutex<PeerState>,
    stopped: AtomicBool,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    apply_tx: UnboundedSender<ApplyMsg>,
}

/// Handle to a running raft peer. Cheap to clone; all clones share one peer.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

impl Raft {
    /// Restore saved state from `storage` and start the election and
    /// replication loops on the current tokio runtime.
    ///
    /// `cluster` lists every member, this one included, in the same order on
    /// every peer. Returns without touching the network.
    pub fn new(
        id: NodeId,
        cluster: Vec<NodeId>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        apply_tx: UnboundedSender<ApplyMsg>,
        config: RaftConfig,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        if !cluster.contains(&id) {
            return Err(RaftError::NotAMember { id });
        }

        let mut node = RaftNode::with_config(id, cluster.clone(), config.clone());
        node.restore(raft_storage::load_state(storage.as_ref())?)?;
        tracing::info!(
            node = id,
            term = node.current_term,
            voted_for = ?node.voted_for,
            last_log_index = node.last_log_index(),
            "raft peer starting"
        );

        let timer = ElectionTimer::new(&node.config);
        let raft = Self {
            inner: Arc::new(Inner {
                id,
                peers: cluster.into_iter().filter(|&p| p != id).collect(),
                config,
                state: Mutex::new(PeerState { node, timer }),
                stopped: AtomicBool::new(false),
                transport,
                storage,
                apply_tx,
            }),
        };

        tokio::spawn(election::run(raft.clone()));
        tokio::spawn(replication::run(raft.clone()));
        Ok(raft)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Current term and whether this peer believes it is the leader
    pub fn get_state(&self) -> (u64, bool) {
        let st = self.lock();
        (st.node.current_term, st.node.is_leader())
    }

    /// Append `command` to the leader's log and return without waiting for
    /// replication. Not being leader is reported through `is_leader`; only a
    /// failure to persist the new entry is an error.
    pub fn start(&self, command: Vec<u8>) -> Result<Proposal, RaftError> {
        let mut st = self.lock();
        let term = st.node.current_term;
        if self.is_killed() || !st.node.is_leader() {
            return Ok(Proposal {
                index: 0,
                term,
                is_leader: false,
            });
        }

        let entry = st.node.append_entry(command);
        if let Err(err) = self.persist(&mut st) {
            st.node.log.pop();
            return Err(err);
        }
        tracing::debug!(node = self.inner.id, term, index = entry.index, "accepted command");
        Ok(Proposal {
            index: entry.index,
            term: entry.term,
            is_leader: true,
        })
    }

    /// Stop the peer. Background loops exit within one tick, inbound requests
    /// go unanswered and replies still in flight are ignored.
    pub fn kill(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!(node = self.inner.id, "raft peer killed");
        }
    }

    pub fn is_killed(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.lock();
        RaftStatus {
            id: self.inner.id,
            role: st.node.state,
            term: st.node.current_term,
            leader: st.node.leader_id,
            commit_index: st.node.commit_index,
            last_applied: st.node.last_applied,
            last_log_index: st.node.last_log_index(),
            last_log_term: st.node.last_log_term(),
        }
    }

    /// Answer a request from another peer. `None` means no reply is sent:
    /// the peer is stopped, the message was not a request, or the state the
    /// reply depends on could not be saved.
    pub fn handle_message(&self, message: RaftMessage) -> Option<RaftMessage> {
        if self.is_killed() {
            return None;
        }
        match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(term, candidate_id, last_log_index, last_log_term),
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            other => {
                tracing::warn!(node = self.inner.id, kind = other.kind(), "dropping reply delivered as a request");
                None
            }
        }
    }

    fn handle_vote_request(
        &self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Option<RaftMessage> {
        let mut st = self.lock();
        let (reply, reset) =
            st.node.handle_vote_request(term, candidate_id, last_log_index, last_log_term);
        if reset {
            st.timer.reset();
        }
        self.persist(&mut st).ok()?;
        Some(reply)
    }

    fn handle_append_entries(
        &self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Option<RaftMessage> {
        let mut st = self.lock();
        let (reply, reset) = st.node.handle_append_entries(
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        );
        if reset {
            st.timer.reset();
        }
        self.persist(&mut st).ok()?;
        self.apply_committed(&mut st);
        Some(reply)
    }

    // -- shared helpers for the background loops --

    pub(crate) fn lock(&self) -> MutexGuard<'_, PeerState> {
        // every critical section leaves the node consistent, so a panic
        // elsewhere does not invalidate it
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &RaftConfig {
        &self.inner.config
    }

    pub(crate) fn peers(&self) -> &[NodeId] {
        &self.inner.peers
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// Save term, vote and log if they changed. On failure the change stays
    /// pending and the caller must not let anything depending on it escape.
    pub(crate) fn persist(&self, st: &mut PeerState) -> Result<(), RaftError> {
        if !st.node.take_persist_pending() {
            return Ok(());
        }
        let state = st.node.hard_state();
        if let Err(err) = raft_storage::save_state(self.inner.storage.as_ref(), &state) {
            st.node.mark_persist_pending();
            tracing::error!(node = self.inner.id, term = state.current_term, error = %err, "failed to persist raft state");
            return Err(err.into());
        }
        Ok(())
    }

    /// Push newly committed entries to the apply channel, in order
    pub(crate) fn apply_committed(&self, st: &mut PeerState) {
        for entry in st.node.get_entries_to_apply() {
            let index = entry.index;
            if self.inner.apply_tx.send(ApplyMsg::from(entry)).is_err() {
                tracing::debug!(node = self.inner.id, index, "apply receiver dropped");
            }
        }
    }
}
