//! # replication
//!
//! why: keep followers' logs in step with the leader and move the commit index
//! relations: background loop spawned by peer.rs, rules live in raft-core's RaftNode
//! what: replication loop, per-follower append-entries, reply handling

use raft_core::{NodeId, RaftMessage};
use tokio::time::{self, MissedTickBehavior};

use crate::peer::Raft;

/// One append-entries request ready to go out
struct Outbound {
    peer: NodeId,
    term: u64,
    request: RaftMessage,
    /// last index the follower holds if it accepts
    covered: u64,
}

/// Push the log to every follower each heartbeat while leader
pub(crate) async fn run(raft: Raft) {
    let mut ticker = time::interval(raft.config().heartbeat());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if raft.is_killed() {
            break;
        }
        for outbound in raft.prepare_append_entries() {
            let raft = raft.clone();
            tokio::spawn(async move {
                let Outbound { peer, term, request, covered } = outbound;
                let reply = raft.transport().call(peer, request).await;
                raft.handle_append_reply(peer, term, covered, reply);
            });
        }
    }
    tracing::debug!(node = raft.id(), "replication loop stopped");
}

impl Raft {
    fn prepare_append_entries(&self) -> Vec<Outbound> {
        let mut st = self.lock();
        if !st.node.is_leader() {
            return Vec::new();
        }
        // never ship entries that are not yet durable here
        if self.persist(&mut st).is_err() {
            return Vec::new();
        }
        if st.node.advance_commit_index() {
            self.apply_committed(&mut st);
        }

        let term = st.node.current_term;
        self.peers()
            .iter()
            .filter_map(|&peer| {
                let request = st.node.create_append_entries(peer)?;
                let covered = match &request {
                    RaftMessage::AppendEntries { prev_log_index, entries, .. } => {
                        prev_log_index + entries.len() as u64
                    }
                    _ => return None,
                };
                Some(Outbound { peer, term, request, covered })
            })
            .collect()
    }

    fn handle_append_reply(
        &self,
        peer: NodeId,
        request_term: u64,
        covered: u64,
        reply: Option<RaftMessage>,
    ) {
        if self.is_killed() {
            return;
        }
        let (term, success) = match reply {
            Some(RaftMessage::AppendEntriesResponse { term, success }) => (term, success),
            Some(other) => {
                tracing::warn!(node = self.id(), peer, kind = other.kind(), "unexpected reply to append entries");
                return;
            }
            None => {
                tracing::trace!(node = self.id(), peer, term = request_term, "append entries lost");
                return;
            }
        };

        let mut st = self.lock();
        // a follower rejecting an older request answers with our current
        // term, which handle_append_entries_response would take for a log
        // mismatch
        if term <= st.node.current_term && st.node.current_term != request_term {
            return;
        }
        if st.node.handle_append_entries_response(term, success, peer, covered) {
            self.apply_committed(&mut st);
        }
        // failure is logged inside persist; nothing waits on this write
        let _ = self.persist(&mut st);
    }
}
